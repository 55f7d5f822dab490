use forecast_service::artifact::ArtifactStore;
use forecast_service::config::ServiceConfig;
use forecast_service::fingerprint::{fingerprint, short};
use forecast_service::kinds::{KindRegistry, ModelKind};
use forecast_service::ledger::{ChangeLedger, LedgerEntry, LedgerError, SledLedger};
use forecast_service::lock::{ArtifactLock, LockOptions};
use forecast_service::orchestrator::{spawn_scheduler, FailureStage, Retrainer, TickError};
use forecast_service::registry::ModelRegistry;
use forecast_service::trainer::Trainer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const V1: &str = "namespace,deployments,requestsCount,time,replicas\n\
    prod,web,100,1,4\nprod,web,200,2,8\nprod,api,100,3,3\ndev,web,10,4,1\ndev,api,20,5,1\n";
const V2: &str = "namespace,deployments,requestsCount,time,replicas\n\
    prod,web,100,1,5\nprod,web,200,2,9\nprod,api,100,3,3\ndev,web,10,4,1\ndev,api,20,5,1\nstaging,web,50,6,2\n";
const WORKLOAD: &str = "namespace,deployments,requestsCount,time,cpu,memory,replicas\n\
    prod,web,100,1,0.5,256,4\nprod,api,200,2,0.9,512,6\ndev,web,10,3,0.1,64,1\ndev,api,20,4,0.2,96,1\n";
const MEM: &str = "namespace,deployments,requestsCount,time,cpu,memory\n\
    prod,web,100,1,0.5,256\nprod,api,200,2,0.9,512\ndev,web,10,3,0.1,64\n";

struct Fixture {
    _root: tempfile::TempDir,
    datasets: PathBuf,
    store: ArtifactStore,
    registry: Arc<ModelRegistry>,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let datasets = root.path().join("datasets");
        std::fs::create_dir(&datasets).unwrap();
        let store = ArtifactStore::new(root.path().join("models"), LockOptions::default());
        store.ensure_dir().unwrap();
        Self { _root: root, datasets, store, registry: Arc::new(ModelRegistry::default()) }
    }

    fn write(&self, name: &str, body: &str) -> PathBuf {
        let p = self.datasets.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    fn retrainer(&self, ledger: Arc<dyn ChangeLedger>) -> Retrainer {
        let mut kinds = KindRegistry::default();
        kinds.bind("replicas", ModelKind::ReplicaCount);
        self.retrainer_with(ledger, kinds)
    }

    fn retrainer_with(&self, ledger: Arc<dyn ChangeLedger>, kinds: KindRegistry) -> Retrainer {
        Retrainer::new(&self.datasets, "csv", 0.1, kinds, ledger, Trainer::new(self.store.clone()), self.registry.clone())
    }
}

#[test]
fn replicas_dataset_lifecycle() {
    let fx = Fixture::new();
    let ledger = SledLedger::temporary().unwrap();
    let retrainer = fx.retrainer(Arc::new(ledger.clone()));

    let path = fx.write("replicas.csv", V1);
    let h1 = fingerprint(&path).unwrap();
    let report = retrainer.run_tick().unwrap();
    assert!(report.any_updated());
    assert!(report.reloaded);
    assert_eq!(report.updated[0].current_hash, short(&h1));
    let entry = ledger.get("replicas").unwrap().unwrap();
    assert_eq!((entry.current_hash.as_str(), entry.previous_hash.as_str()), (h1.as_str(), h1.as_str()));
    assert_eq!(fx.registry.names(), vec!["replicas".to_string()]);

    fx.write("replicas.csv", V2);
    let h2 = fingerprint(&path).unwrap();
    assert_ne!(h1, h2);
    let report = retrainer.run_tick().unwrap();
    assert_eq!(report.updated.len(), 1);
    assert_eq!(report.updated[0].previous_hash, short(&h1));
    let entry = ledger.get("replicas").unwrap().unwrap();
    assert_eq!((entry.current_hash.as_str(), entry.previous_hash.as_str()), (h2.as_str(), h1.as_str()));
    let loaded = fx.registry.get("replicas").unwrap();
    assert_eq!(loaded.manifest.dataset_fingerprint, h2);
    assert!(loaded.manifest.vocabularies["namespace"].contains(&"staging".to_string()));

    let report = retrainer.run_tick().unwrap();
    assert!(!report.any_updated());
    assert!(!report.reloaded);
    assert_eq!(report.unchanged, vec!["replicas".to_string()]);
    assert_eq!(ledger.get("replicas").unwrap().unwrap().current_hash, h2);
}

#[test]
fn unknown_kind_fails_only_that_model() {
    let fx = Fixture::new();
    let ledger = SledLedger::temporary().unwrap();
    let retrainer = fx.retrainer(Arc::new(ledger.clone()));
    fx.write("mystery.csv", V1);
    fx.write("replicas.csv", V1);
    fx.write("mem_manager.csv", MEM);

    let report = retrainer.run_tick().unwrap();
    let updated: Vec<&str> = report.updated.iter().map(|u| u.model.as_str()).collect();
    assert_eq!(updated, vec!["mem_manager", "replicas"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].model, "mystery");
    assert_eq!(report.failures[0].stage, FailureStage::Kind);
    assert!(ledger.get("mystery").unwrap().is_none());
    assert_eq!(fx.registry.names(), vec!["mem_manager".to_string(), "replicas".to_string()]);
}

#[test]
fn broken_dataset_is_retried_next_tick() {
    let fx = Fixture::new();
    let ledger = SledLedger::temporary().unwrap();
    let retrainer = fx.retrainer(Arc::new(ledger.clone()));
    fx.write("replicas.csv", "namespace,time\nprod,1\n");

    let report = retrainer.run_tick().unwrap();
    assert_eq!(report.failures[0].stage, FailureStage::Train);
    assert!(!report.published);
    assert!(ledger.get("replicas").unwrap().is_none());

    fx.write("replicas.csv", V1);
    let report = retrainer.run_tick().unwrap();
    assert!(report.failures.is_empty());
    assert!(report.any_updated());
}

#[test]
fn missing_datasets_directory_aborts_tick() {
    let fx = Fixture::new();
    std::fs::remove_dir(&fx.datasets).unwrap();
    let retrainer = fx.retrainer(Arc::new(SledLedger::temporary().unwrap()));
    assert!(matches!(retrainer.run_tick(), Err(TickError::Listing { .. })));
}

#[test]
fn rebinding_kind_retrains_unchanged_dataset() {
    let fx = Fixture::new();
    let ledger = SledLedger::temporary().unwrap();
    let path = fx.write("workload.csv", WORKLOAD);
    let h = fingerprint(&path).unwrap();

    let mut kinds = KindRegistry::default();
    kinds.bind("workload", ModelKind::ReplicaCount);
    let report = fx.retrainer_with(Arc::new(ledger.clone()), kinds).run_tick().unwrap();
    assert!(report.any_updated());
    assert_eq!(fx.registry.get("workload").unwrap().manifest.kind, ModelKind::ReplicaCount);

    let mut kinds = KindRegistry::default();
    kinds.bind("workload", ModelKind::ResourceUsage);
    let retrainer = fx.retrainer_with(Arc::new(ledger.clone()), kinds);
    let report = retrainer.run_tick().unwrap();
    assert_eq!(report.updated.len(), 1);
    assert!(report.reloaded);
    let loaded = fx.registry.get("workload").unwrap();
    assert_eq!(loaded.manifest.kind, ModelKind::ResourceUsage);
    assert_eq!(loaded.manifest.target_columns, vec!["cpu".to_string(), "memory".to_string()]);
    let entry = ledger.get("workload").unwrap().unwrap();
    assert_eq!((entry.current_hash.as_str(), entry.previous_hash.as_str()), (h.as_str(), h.as_str()));

    let report = retrainer.run_tick().unwrap();
    assert_eq!(report.unchanged, vec!["workload".to_string()]);
}

/// Ledger double with switchable failures.
#[derive(Default)]
struct FlakyLedger {
    inner: HashMap<String, LedgerEntry>,
    fail_fetch: bool,
    fail_writes: bool,
}

impl ChangeLedger for FlakyLedger {
    fn fetch_all(&self) -> Result<HashMap<String, LedgerEntry>, LedgerError> {
        if self.fail_fetch { return Err(LedgerError::NotFound("*".into())); }
        Ok(self.inner.clone())
    }
    fn insert(&self, model: &str, _hash: &str) -> Result<(), LedgerError> {
        if self.fail_writes { return Err(LedgerError::AlreadyExists(model.into())); }
        Ok(())
    }
    fn update(&self, model: &str, _new: &str, _old: &str) -> Result<(), LedgerError> {
        if self.fail_writes { return Err(LedgerError::NotFound(model.into())); }
        Ok(())
    }
}

#[test]
fn unreachable_ledger_aborts_tick() {
    let fx = Fixture::new();
    fx.write("replicas.csv", V1);
    let retrainer = fx.retrainer(Arc::new(FlakyLedger { fail_fetch: true, ..Default::default() }));
    assert!(matches!(retrainer.run_tick(), Err(TickError::Ledger(_))));
    assert!(fx.store.list().unwrap().is_empty());
}

#[test]
fn ledger_write_failure_is_isolated_but_model_still_reloads() {
    let fx = Fixture::new();
    fx.write("replicas.csv", V1);
    fx.write("mem_manager.csv", MEM);
    let retrainer = fx.retrainer(Arc::new(FlakyLedger { fail_writes: true, ..Default::default() }));
    let report = retrainer.run_tick().unwrap();
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| f.stage == FailureStage::Ledger));
    assert!(!report.any_updated());
    assert!(report.published && report.reloaded);
    assert_eq!(fx.registry.names().len(), 2);
}

#[test]
fn failed_reload_is_retried_on_next_tick() {
    let fx = Fixture::new();
    let retrainer = fx.retrainer(Arc::new(SledLedger::temporary().unwrap()));
    fx.write("replicas.csv", V1);
    let corrupt = fx.store.dir().join("orphan.json");
    std::fs::write(&corrupt, b"{").unwrap();

    let report = retrainer.run_tick().unwrap();
    assert!(report.published && !report.reloaded);
    assert!(retrainer.reload_pending());
    assert!(fx.registry.names().is_empty());

    std::fs::remove_file(&corrupt).unwrap();
    let report = retrainer.run_tick().unwrap();
    assert!(!report.any_updated());
    assert!(report.reloaded);
    assert!(!retrainer.reload_pending());
    assert_eq!(fx.registry.names(), vec!["replicas".to_string()]);
}

fn config_in(root: &Path) -> ServiceConfig {
    ServiceConfig {
        datasets_dir: root.join("datasets"),
        models_dir: root.join("models"),
        ledger_path: root.join("ledger"),
        model_kinds: HashMap::from([("replicas".to_string(), ModelKind::ReplicaCount)]),
        ..ServiceConfig::default()
    }
}

#[tokio::test]
async fn bootstrap_trains_then_serves_snapshot() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config_in(root.path());
    std::fs::create_dir_all(&cfg.datasets_dir).unwrap();
    std::fs::write(cfg.datasets_dir.join("replicas.csv"), V1).unwrap();

    let service = forecast_service::bootstrap(&cfg).await.unwrap();
    assert_eq!(service.initial_report.updated.len(), 1);
    assert_eq!(service.state.registry.names(), vec!["replicas".to_string()]);
    assert!(cfg.models_dir.join("replicas.json").exists());
}

#[tokio::test]
async fn bootstrap_fails_when_ledger_cannot_open() {
    let root = tempfile::tempdir().unwrap();
    let cfg = config_in(root.path());
    std::fs::write(&cfg.ledger_path, b"not a sled directory").unwrap();

    let err = forecast_service::bootstrap(&cfg).await.err().expect("bootstrap must fail");
    assert!(format!("{err:#}").starts_with("opening ledger at "), "{err:#}");
}

#[tokio::test]
async fn restart_ignores_lock_file_left_by_dead_process() {
    let root = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig { lock_timeout_ms: 300, ..config_in(root.path()) };
    std::fs::create_dir_all(&cfg.datasets_dir).unwrap();
    std::fs::write(cfg.datasets_dir.join("replicas.csv"), V1).unwrap();
    drop(forecast_service::bootstrap(&cfg).await.unwrap());

    std::fs::write(cfg.models_dir.join("replicas.json.lock"), b"999999\n").unwrap();
    let restarted = ServiceConfig { ledger_path: root.path().join("ledger-restart"), ..cfg.clone() };
    let service = forecast_service::bootstrap(&restarted).await.unwrap();
    assert_eq!(service.state.registry.names(), vec!["replicas".to_string()]);
}

#[tokio::test]
async fn startup_fails_while_artifact_lock_is_held() {
    let root = tempfile::tempdir().unwrap();
    let cfg = ServiceConfig { lock_timeout_ms: 100, ..config_in(root.path()) };
    std::fs::create_dir_all(&cfg.datasets_dir).unwrap();
    std::fs::write(cfg.datasets_dir.join("replicas.csv"), V1).unwrap();
    drop(forecast_service::bootstrap(&cfg).await.unwrap());

    let _held = ArtifactLock::acquire(&cfg.models_dir.join("replicas.json.lock"), LockOptions::default()).unwrap();
    let restarted = ServiceConfig { ledger_path: root.path().join("ledger-restart"), ..cfg.clone() };
    let err = forecast_service::bootstrap(&restarted).await.err().expect("held lock must block startup");
    let rendered = format!("{err:#}");
    assert!(rendered.starts_with("loading published models: loading artifact `replicas`: "), "{rendered}");
    assert_eq!(rendered.matches("timed out").count(), 1, "{rendered}");
}

#[tokio::test(start_paused = true)]
async fn scheduler_retrains_changed_dataset_after_interval() {
    let fx = Fixture::new();
    let ledger = SledLedger::temporary().unwrap();
    let retrainer = Arc::new(fx.retrainer(Arc::new(ledger.clone())));
    let path = fx.write("replicas.csv", V1);
    retrainer.run_tick().unwrap();

    let scheduler = spawn_scheduler(retrainer.clone(), Duration::from_secs(60));
    fx.write("replicas.csv", V2);
    let h2 = fingerprint(&path).unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    // the tick itself runs on the blocking pool, outside paused time
    let deadline = Instant::now() + Duration::from_secs(10);
    while fx.registry.get("replicas").unwrap().manifest.dataset_fingerprint != h2 {
        assert!(Instant::now() < deadline, "scheduled tick never retrained the dataset");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(ledger.get("replicas").unwrap().unwrap().current_hash, h2);
    scheduler.abort();
}
