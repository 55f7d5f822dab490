use super::{workload_domain_errors, workload_features, KindError, ModelKind, ModelKindStrategy, RequestShape, TrainingPlan, WorkloadRequest};
use crate::artifact::ArtifactManifest;
use crate::dataset::FeatureRow;
use crate::pipeline::Estimator;
use serde_json::{json, Value};

/// CPU and memory needs of a deployment at a given load.
pub struct ResourceUsage;

impl ModelKindStrategy for ResourceUsage {
    fn kind(&self) -> ModelKind { ModelKind::ResourceUsage }

    fn describe_request_shape(&self) -> RequestShape { WorkloadRequest::shape() }

    fn extract_feature_vector(&self, request: &WorkloadRequest) -> FeatureRow { request.feature_row() }

    fn postprocess_prediction(&self, raw: &[f64]) -> Result<Value, KindError> {
        match raw {
            [cpu, memory] => Ok(json!({"cpu": cpu, "memory": memory})),
            _ => Err(KindError::OutputArity { expected: 2, got: raw.len() }),
        }
    }

    fn build_trainer(&self, ridge_alpha: f64) -> TrainingPlan {
        let feature_columns = workload_features();
        TrainingPlan {
            estimator: Estimator::ridge(&feature_columns, ridge_alpha),
            feature_columns,
            target_columns: vec!["cpu".into(), "memory".into()],
        }
    }

    fn validate_against_trained_domains(&self, request: &WorkloadRequest, manifest: &ArtifactManifest) -> Vec<String> {
        workload_domain_errors(request, manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_cpu_and_memory() {
        assert_eq!(ResourceUsage.postprocess_prediction(&[0.5, 256.0]).unwrap(), json!({"cpu": 0.5, "memory": 256.0}));
        assert_eq!(ResourceUsage.postprocess_prediction(&[0.5]).unwrap_err(), KindError::OutputArity { expected: 2, got: 1 });
    }

    #[test]
    fn trains_on_cpu_and_memory() {
        let plan = ResourceUsage.build_trainer(1.0);
        assert_eq!(plan.target_columns, vec!["cpu".to_string(), "memory".to_string()]);
        assert_eq!(plan.feature_columns.len(), 4);
    }
}
