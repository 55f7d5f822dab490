//! Live set of loaded models. Readers take one snapshot and keep it for the
//! whole request; a reload builds a complete new snapshot before swapping it in.

use crate::artifact::{ArtifactError, ArtifactManifest, ArtifactStore};
use crate::metrics::METRICS;
use crate::pipeline::{Pipeline, PipelineError};
use crate::dataset::FeatureRow;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("listing artifacts")]
    Listing(#[source] ArtifactError),
    #[error("loading artifact `{model}`")]
    Load { model: String, #[source] source: ArtifactError },
    #[error("model `{0}` is not loaded")]
    NotFound(String),
}

#[derive(Debug)]
pub struct LoadedModel {
    pub manifest: ArtifactManifest,
    pipeline: Pipeline,
}

impl LoadedModel {
    pub fn predict(&self, row: FeatureRow) -> Result<Vec<f64>, PipelineError> {
        let mut out = self.pipeline.predict(&[row])?;
        out.pop().ok_or(PipelineError::Arity { expected: 1, got: 0 })
    }
}

pub type Snapshot = HashMap<String, Arc<LoadedModel>>;

pub struct ModelRegistry {
    current: ArcSwap<Snapshot>,
}

impl Default for ModelRegistry {
    fn default() -> Self { Self { current: ArcSwap::from_pointee(Snapshot::new()) } }
}

impl ModelRegistry {
    /// Read every published artifact into a fresh mapping. Any unreadable
    /// artifact fails the whole load so a snapshot is never half-built.
    pub fn load_all(store: &ArtifactStore) -> Result<Snapshot, RegistryError> {
        let mut snapshot = Snapshot::new();
        for model in store.list().map_err(RegistryError::Listing)? {
            let artifact = store.read(&model).map_err(|source| RegistryError::Load { model: model.clone(), source })?;
            if artifact.manifest.model_name != model {
                warn!(file = %model, manifest = %artifact.manifest.model_name, "artifact manifest names a different model; keyed by file name");
            }
            snapshot.insert(model, Arc::new(LoadedModel { manifest: artifact.manifest, pipeline: artifact.pipeline }));
        }
        Ok(snapshot)
    }

    /// Rebuild from disk and swap in. On error the previous snapshot stays live.
    pub fn reload(&self, store: &ArtifactStore) -> Result<usize, RegistryError> {
        match Self::load_all(store) {
            Ok(next) => {
                let count = next.len();
                self.current.store(Arc::new(next));
                METRICS.retrain.reloads_total.with_label_values(&["ok"]).inc();
                METRICS.retrain.loaded_models.set(count as i64);
                kubecast_core::set_status_detail("loaded_models", count);
                info!(models = count, "registry reloaded");
                Ok(count)
            }
            Err(e) => {
                METRICS.retrain.reloads_total.with_label_values(&["error"]).inc();
                warn!(error = %crate::error_chain(&e), "registry reload failed; keeping previous snapshot");
                Err(e)
            }
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> { self.current.load_full() }

    pub fn get(&self, model: &str) -> Result<Arc<LoadedModel>, RegistryError> {
        self.current.load().get(model).cloned().ok_or_else(|| RegistryError::NotFound(model.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.current.load().keys().cloned().collect();
        names.sort();
        names
    }
}
