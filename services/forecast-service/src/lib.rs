//! Resource forecast service: serves regression models for Kubernetes
//! workloads and retrains them whenever their training datasets change.

pub mod api;
pub mod artifact;
pub mod config;
pub mod dataset;
pub mod fingerprint;
pub mod kinds;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod trainer;

use anyhow::{bail, Context, Result};
use api::AppState;
use artifact::ArtifactStore;
use config::ServiceConfig;
use kubecast_core::{retry_async, RetryConfig, StartupState};
use ledger::SledLedger;
use orchestrator::{Retrainer, TickReport};
use registry::ModelRegistry;
use std::sync::Arc;
use tracing::info;
use trainer::Trainer;

/// Render an error and its causes on one line, `outer: cause: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cause = e.source();
    }
    out
}

/// Everything the binary needs once startup has succeeded.
pub struct Service {
    pub retrainer: Arc<Retrainer>,
    pub state: AppState,
    pub initial_report: TickReport,
}

/// Open the ledger, load published models and run the first retrain tick.
/// Any failure here is fatal: the caller must not serve.
pub async fn bootstrap(cfg: &ServiceConfig) -> Result<Service> {
    let mut startup = StartupState::new();
    kubecast_core::set_status_detail("startup_phase", startup.phase().as_str());

    std::fs::create_dir_all(&cfg.datasets_dir).with_context(|| format!("creating {}", cfg.datasets_dir.display()))?;
    let store = ArtifactStore::new(&cfg.models_dir, cfg.lock_options());
    store.ensure_dir()?;

    let ledger_path = cfg.ledger_path.clone();
    let ledger = retry_async(&RetryConfig::default(), |_attempt| {
        let path = ledger_path.clone();
        async move { SledLedger::open(&path) }
    })
    .await
    .with_context(|| format!("opening ledger at {}", ledger_path.display()))?;
    startup.advance();

    let registry = Arc::new(ModelRegistry::default());
    registry.reload(&store).context("loading published models")?;
    startup.advance();

    let retrainer = Arc::new(Retrainer::new(
        &cfg.datasets_dir,
        cfg.dataset_extension.clone(),
        cfg.ridge_alpha,
        cfg.kind_registry(),
        Arc::new(ledger),
        Trainer::new(store),
        registry.clone(),
    ));
    let tick = retrainer.clone();
    let initial_report = tokio::task::spawn_blocking(move || tick.run_tick())
        .await
        .context("initial retrain task")?
        .context("initial retrain")?;
    if retrainer.reload_pending() {
        bail!("registry reload failed after initial retrain");
    }
    startup.advance();
    info!(elapsed = ?startup.elapsed(), models = registry.names().len(), "startup complete");

    let state = AppState { registry, kinds: Arc::new(cfg.kind_registry()) };
    Ok(Service { retrainer, state, initial_report })
}
