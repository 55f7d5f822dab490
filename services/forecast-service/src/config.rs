use crate::kinds::{KindRegistry, ModelKind};
use crate::lock::LockOptions;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default = "default_datasets_dir")]
    pub datasets_dir: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_dataset_extension")]
    pub dataset_extension: String,
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default = "default_retrain_interval_secs")]
    pub retrain_interval_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_ridge_alpha")]
    pub ridge_alpha: f64,
    /// Extra or overriding model name -> kind bindings.
    #[serde(default)]
    pub model_kinds: HashMap<String, ModelKind>,
}

fn default_service_name() -> String { "forecast-service".into() }
fn default_listen_addr() -> String { "0.0.0.0:8000".into() }
fn default_health_port() -> u16 { 9090 }
fn default_datasets_dir() -> PathBuf { PathBuf::from("datasets") }
fn default_models_dir() -> PathBuf { PathBuf::from("models") }
fn default_dataset_extension() -> String { "csv".into() }
fn default_ledger_path() -> PathBuf { PathBuf::from("hash_tracker.db") }
fn default_retrain_interval_secs() -> u64 { 900 }
fn default_lock_timeout_ms() -> u64 { 10_000 }
fn default_ridge_alpha() -> f64 { 1.0 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            listen_addr: default_listen_addr(),
            health_port: default_health_port(),
            datasets_dir: default_datasets_dir(),
            models_dir: default_models_dir(),
            dataset_extension: default_dataset_extension(),
            ledger_path: default_ledger_path(),
            retrain_interval_secs: default_retrain_interval_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            ridge_alpha: default_ridge_alpha(),
            model_kinds: HashMap::new(),
        }
    }
}

impl ServiceConfig {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions { timeout: Duration::from_millis(self.lock_timeout_ms) }
    }

    pub fn retrain_interval(&self) -> Duration { Duration::from_secs(self.retrain_interval_secs.max(1)) }

    pub fn kind_registry(&self) -> KindRegistry { KindRegistry::with_overrides(&self.model_kinds) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let cfg: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.retrain_interval_secs, 900);
        assert_eq!(cfg.dataset_extension, "csv");
        assert_eq!(cfg.lock_options().timeout, Duration::from_secs(10));
    }

    #[test]
    fn model_kinds_extend_defaults() {
        let cfg: ServiceConfig = serde_json::from_str(r#"{"model_kinds": {"replicas": "replica_count"}}"#).unwrap();
        let kinds = cfg.kind_registry();
        assert_eq!(kinds.resolve("replicas").unwrap(), ModelKind::ReplicaCount);
        assert_eq!(kinds.resolve("mem_manager").unwrap(), ModelKind::ResourceUsage);
    }
}
