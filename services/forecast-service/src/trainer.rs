//! Fit a model on its dataset and publish the artifact.

use crate::artifact::{ArtifactError, ArtifactManifest, ArtifactStore, ModelArtifact};
use crate::dataset::{load_frame, DatasetError};
use crate::kinds::{ModelKind, TrainingPlan};
use crate::metrics::METRICS;
use crate::pipeline::{Pipeline, PipelineError};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("fitting `{model}`")]
    Fit { model: String, #[source] source: PipelineError },
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub model_name: String,
    pub kind: ModelKind,
    pub dataset_path: PathBuf,
    pub dataset_fingerprint: String,
    pub plan: TrainingPlan,
}

#[derive(Debug, Clone)]
pub struct Trainer {
    store: ArtifactStore,
}

impl Trainer {
    pub fn new(store: ArtifactStore) -> Self { Self { store } }

    pub fn store(&self) -> &ArtifactStore { &self.store }

    #[instrument(skip_all, fields(model = %job.model_name, kind = %job.kind))]
    pub fn train_and_save(&self, job: TrainingJob) -> Result<PathBuf, TrainError> {
        let start = Instant::now();
        let TrainingJob { model_name, kind, dataset_path, dataset_fingerprint, plan } = job;
        let frame = load_frame(&dataset_path, &plan.feature_columns, &plan.target_columns)?;
        let mut pipeline = Pipeline::single(plan.estimator);
        pipeline.fit(&frame).map_err(|source| TrainError::Fit { model: model_name.clone(), source })?;
        let manifest = ArtifactManifest {
            model_name: model_name.clone(),
            kind,
            feature_columns: plan.feature_columns.iter().map(|c| c.name.clone()).collect(),
            target_columns: plan.target_columns,
            vocabularies: pipeline.vocabularies(),
            dataset_fingerprint,
            trained_rows: frame.len(),
            trained_at: Utc::now(),
        };
        let path = self.store.publish(&ModelArtifact { manifest, pipeline })?;
        let elapsed = start.elapsed();
        METRICS.retrain.training_seconds.with_label_values(&[model_name.as_str()]).observe(elapsed.as_secs_f64());
        info!(rows = frame.len(), ?elapsed, "model trained");
        Ok(path)
    }
}
