use super::{workload_domain_errors, workload_features, KindError, ModelKind, ModelKindStrategy, RequestShape, TrainingPlan, WorkloadRequest};
use crate::artifact::ArtifactManifest;
use crate::dataset::FeatureRow;
use crate::pipeline::Estimator;
use serde_json::{json, Value};

/// Replica count for a deployment at a given load.
pub struct ReplicaCount;

impl ModelKindStrategy for ReplicaCount {
    fn kind(&self) -> ModelKind { ModelKind::ReplicaCount }

    fn describe_request_shape(&self) -> RequestShape { WorkloadRequest::shape() }

    fn extract_feature_vector(&self, request: &WorkloadRequest) -> FeatureRow { request.feature_row() }

    fn postprocess_prediction(&self, raw: &[f64]) -> Result<Value, KindError> {
        match raw {
            [replicas] => Ok(json!({"replicas": replicas.round().max(0.0) as i64})),
            _ => Err(KindError::OutputArity { expected: 1, got: raw.len() }),
        }
    }

    fn build_trainer(&self, ridge_alpha: f64) -> TrainingPlan {
        let feature_columns = workload_features();
        TrainingPlan {
            estimator: Estimator::ridge(&feature_columns, ridge_alpha),
            feature_columns,
            target_columns: vec!["replicas".into()],
        }
    }

    fn validate_against_trained_domains(&self, request: &WorkloadRequest, manifest: &ArtifactManifest) -> Vec<String> {
        workload_domain_errors(request, manifest)
    }
}
