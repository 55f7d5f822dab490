//! Model kinds: the per-task rules for turning requests into features,
//! shaping raw predictions, and checking request values against what a model
//! was trained on.

mod replica_count;
mod resource_usage;

pub use replica_count::ReplicaCount;
pub use resource_usage::ResourceUsage;

use crate::artifact::ArtifactManifest;
use crate::dataset::{ColumnSpec, FeatureRow, FeatureValue};
use crate::pipeline::Estimator;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum KindError {
    #[error("no model kind registered for model `{0}`")]
    Unregistered(String),
    #[error("unknown model kind `{0}`")]
    UnknownKind(String),
    #[error("model produced {got} outputs, expected {expected}")]
    OutputArity { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    ResourceUsage,
    ReplicaCount,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::ResourceUsage => "resource_usage",
            ModelKind::ReplicaCount => "replica_count",
        }
    }

    pub fn strategy(&self) -> &'static dyn ModelKindStrategy {
        match self {
            ModelKind::ResourceUsage => &ResourceUsage,
            ModelKind::ReplicaCount => &ReplicaCount,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for ModelKind {
    type Err = KindError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource_usage" => Ok(ModelKind::ResourceUsage),
            "replica_count" => Ok(ModelKind::ReplicaCount),
            other => Err(KindError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType { String, Integer }

impl FieldType {
    fn accepts(&self, v: &Value) -> bool {
        match self {
            FieldType::String => v.is_string(),
            FieldType::Integer => v.is_i64() || v.is_u64(),
        }
    }
    fn label(&self) -> &'static str {
        match self { FieldType::String => "string", FieldType::Integer => "integer" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShape {
    pub fields: Vec<(&'static str, FieldType)>,
}

impl RequestShape {
    /// Every problem with `body` against this shape; empty when it conforms.
    /// Unknown fields are ignored.
    pub fn check(&self, body: &Value) -> Vec<String> {
        let Some(obj) = body.as_object() else { return vec!["request body must be a JSON object".to_string()] };
        self.fields.iter().filter_map(|(name, ty)| match obj.get(*name) {
            None => Some(format!("field `{name}` is required")),
            Some(v) if !ty.accepts(v) => Some(format!("field `{name}` must be a {}", ty.label())),
            Some(_) => None,
        }).collect()
    }
}

/// Request body shared by the workload kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadRequest {
    pub namespace: String,
    pub deployment: String,
    #[serde(rename = "requestsCount")]
    pub requests_count: i64,
    pub time: i64,
}

impl WorkloadRequest {
    pub fn shape() -> RequestShape {
        RequestShape { fields: vec![
            ("namespace", FieldType::String),
            ("deployment", FieldType::String),
            ("requestsCount", FieldType::Integer),
            ("time", FieldType::Integer),
        ] }
    }

    /// Shape-check then decode.
    pub fn parse(body: &Value) -> Result<Self, Vec<String>> {
        let problems = Self::shape().check(body);
        if !problems.is_empty() { return Err(problems); }
        serde_json::from_value(body.clone()).map_err(|e| vec![e.to_string()])
    }

    fn feature_row(&self) -> FeatureRow {
        vec![
            FeatureValue::Text(self.namespace.clone()),
            FeatureValue::Text(self.deployment.clone()),
            FeatureValue::Number(self.requests_count as f64),
            FeatureValue::Number(self.time as f64),
        ]
    }
}

pub const NAMESPACE_COLUMN: &str = "namespace";
pub const DEPLOYMENT_COLUMN: &str = "deployments";

fn workload_features() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::categorical(NAMESPACE_COLUMN),
        ColumnSpec::categorical(DEPLOYMENT_COLUMN),
        ColumnSpec::numeric("requestsCount"),
        ColumnSpec::numeric("time"),
    ]
}

/// What a kind needs trained: a fresh estimator and the columns it reads.
#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub estimator: Estimator,
    pub feature_columns: Vec<ColumnSpec>,
    pub target_columns: Vec<String>,
}

pub trait ModelKindStrategy: Send + Sync {
    fn kind(&self) -> ModelKind;
    fn describe_request_shape(&self) -> RequestShape;
    fn extract_feature_vector(&self, request: &WorkloadRequest) -> FeatureRow;
    fn postprocess_prediction(&self, raw: &[f64]) -> Result<Value, KindError>;
    fn build_trainer(&self, ridge_alpha: f64) -> TrainingPlan;
    /// Human-readable problems for request values outside the model's trained
    /// categorical domains. Prediction must not run unless this is empty.
    fn validate_against_trained_domains(&self, request: &WorkloadRequest, manifest: &ArtifactManifest) -> Vec<String>;
}

fn format_domain(values: &[String]) -> String { format!("[{}]", values.join(", ")) }

/// Namespace and deployment checks shared by the workload kinds.
fn workload_domain_errors(request: &WorkloadRequest, manifest: &ArtifactManifest) -> Vec<String> {
    let empty = Vec::new();
    let namespaces = manifest.vocabularies.get(NAMESPACE_COLUMN).unwrap_or(&empty);
    let deployments = manifest.vocabularies.get(DEPLOYMENT_COLUMN).unwrap_or(&empty);
    let mut errors = Vec::new();
    if !namespaces.contains(&request.namespace) {
        errors.push(format!("Current namespace value [ {} ] is invalid. Valid namespaces are {}", request.namespace, format_domain(namespaces)));
    }
    if !deployments.contains(&request.deployment) {
        errors.push(format!("Current deployment name [ {} ] is invalid. Valid deployment values are {}", request.deployment, format_domain(deployments)));
    }
    errors
}

/// Binding from model name to kind. Defaults cover the stock models and can be
/// extended or overridden from configuration.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    bindings: HashMap<String, ModelKind>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        let bindings = HashMap::from([
            ("mem_manager".to_string(), ModelKind::ResourceUsage),
            ("replicas_manager".to_string(), ModelKind::ReplicaCount),
        ]);
        Self { bindings }
    }
}

impl KindRegistry {
    pub fn with_overrides(overrides: &HashMap<String, ModelKind>) -> Self {
        let mut reg = Self::default();
        reg.bindings.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        reg
    }

    pub fn bind(&mut self, model: &str, kind: ModelKind) { self.bindings.insert(model.to_string(), kind); }

    pub fn resolve(&self, model: &str) -> Result<ModelKind, KindError> {
        self.bindings.get(model).copied().ok_or_else(|| KindError::Unregistered(model.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(kind: ModelKind) -> ArtifactManifest {
        ArtifactManifest {
            model_name: "m".into(),
            kind,
            feature_columns: vec![],
            target_columns: vec![],
            vocabularies: [
                (NAMESPACE_COLUMN.to_string(), vec!["dev".to_string(), "prod".to_string()]),
                (DEPLOYMENT_COLUMN.to_string(), vec!["api".to_string(), "web".to_string()]),
            ].into_iter().collect(),
            dataset_fingerprint: "h".into(),
            trained_rows: 1,
            trained_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn kind_names_roundtrip_through_serde_and_fromstr() {
        assert_eq!(serde_json::to_value(ModelKind::ReplicaCount).unwrap(), json!("replica_count"));
        assert_eq!("resource_usage".parse::<ModelKind>().unwrap(), ModelKind::ResourceUsage);
        assert!(matches!("bogus".parse::<ModelKind>(), Err(KindError::UnknownKind(_))));
    }

    #[test]
    fn registry_defaults_and_overrides() {
        let overrides = HashMap::from([("replicas".to_string(), ModelKind::ReplicaCount)]);
        let reg = KindRegistry::with_overrides(&overrides);
        assert_eq!(reg.resolve("mem_manager").unwrap(), ModelKind::ResourceUsage);
        assert_eq!(reg.resolve("replicas").unwrap(), ModelKind::ReplicaCount);
        assert_eq!(reg.resolve("cpu_hog").unwrap_err(), KindError::Unregistered("cpu_hog".into()));
    }

    #[test]
    fn shape_reports_every_problem() {
        let problems = WorkloadRequest::shape().check(&json!({"namespace": 3, "time": "noon"}));
        assert_eq!(problems.len(), 4, "{problems:?}");
        assert!(problems.iter().any(|p| p.contains("`namespace` must be a string")));
        assert!(problems.iter().any(|p| p.contains("`deployment` is required")));
        assert_eq!(WorkloadRequest::shape().check(&json!([1, 2])).len(), 1);
    }

    #[test]
    fn parse_reads_camel_case_count() {
        let req = WorkloadRequest::parse(&json!({"namespace": "prod", "deployment": "web", "requestsCount": 120, "time": 5, "extra": true})).unwrap();
        assert_eq!(req.requests_count, 120);
        assert_eq!(req.feature_row()[2], FeatureValue::Number(120.0));
    }

    #[test]
    fn out_of_vocabulary_lists_each_field_with_valid_values() {
        let req = WorkloadRequest { namespace: "qa".into(), deployment: "batch".into(), requests_count: 1, time: 1 };
        let errors = ModelKind::ReplicaCount.strategy().validate_against_trained_domains(&req, &manifest(ModelKind::ReplicaCount));
        assert_eq!(errors, vec![
            "Current namespace value [ qa ] is invalid. Valid namespaces are [dev, prod]".to_string(),
            "Current deployment name [ batch ] is invalid. Valid deployment values are [api, web]".to_string(),
        ]);
        let ok = WorkloadRequest { namespace: "prod".into(), deployment: "web".into(), requests_count: 1, time: 1 };
        assert!(ModelKind::ResourceUsage.strategy().validate_against_trained_domains(&ok, &manifest(ModelKind::ResourceUsage)).is_empty());
    }
}
