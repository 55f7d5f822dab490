//! HTTP surface: prediction, model listing, manifest lookup.

use crate::kinds::{KindRegistry, WorkloadRequest};
use crate::metrics::METRICS;
use crate::registry::ModelRegistry;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub kinds: Arc<KindRegistry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl PredictionResponse {
    fn success(result: Value) -> Self {
        Self { status: "success", message: "Predicted the result successfully".into(), result: Some(result), errors: Vec::new() }
    }
    fn failure(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self { status: "failure", message: message.into(), result: None, errors }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/:model_name", get(model_manifest))
        .route("/models/predict/:model_name", post(predict))
        .with_state(state)
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"models": state.registry.names()}))
}

pub async fn model_manifest(State(state): State<AppState>, Path(model_name): Path<String>) -> (StatusCode, Json<Value>) {
    match state.registry.get(&model_name) {
        Ok(model) => (StatusCode::OK, Json(json!(model.manifest))),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

pub async fn predict(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<PredictionResponse>) {
    let timer = METRICS.api.prediction_latency_seconds.start_timer();
    let (status, resp) = predict_inner(&state, &model_name, body);
    timer.observe_duration();
    let label = if state.registry.get(&model_name).is_ok() { model_name.as_str() } else { "unknown" };
    METRICS.api.predictions_total.with_label_values(&[label, resp.status]).inc();
    (status, Json(resp))
}

fn predict_inner(state: &AppState, model_name: &str, body: Result<Json<Value>, JsonRejection>) -> (StatusCode, PredictionResponse) {
    let body = match body {
        Ok(Json(v)) => v,
        Err(rejection) => return (StatusCode::BAD_REQUEST, PredictionResponse::failure("Malformed request body", vec![rejection.body_text()])),
    };
    let kind = match state.kinds.resolve(model_name) {
        Ok(k) => k,
        Err(_) => return (StatusCode::BAD_REQUEST, PredictionResponse::failure(format!("Validation failed for the current model {model_name}"), Vec::new())),
    };
    // one snapshot for the whole request
    let snapshot = state.registry.snapshot();
    let Some(model) = snapshot.get(model_name) else {
        return (StatusCode::NOT_FOUND, PredictionResponse::failure(format!("Model {model_name} is not loaded"), Vec::new()));
    };
    if model.manifest.kind != kind {
        warn!(model = model_name, bound = %kind, trained = %model.manifest.kind, "loaded artifact was trained as a different kind");
        return (StatusCode::INTERNAL_SERVER_ERROR, PredictionResponse::failure(format!("Model {model_name} was trained as {}", model.manifest.kind), Vec::new()));
    }
    let strategy = kind.strategy();

    let problems = strategy.describe_request_shape().check(&body);
    if !problems.is_empty() {
        return (StatusCode::BAD_REQUEST, PredictionResponse::failure("Validation failed for the inputs", problems));
    }
    let request: WorkloadRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, PredictionResponse::failure("Validation failed for the inputs", vec![e.to_string()])),
    };
    let errors = strategy.validate_against_trained_domains(&request, &model.manifest);
    if !errors.is_empty() {
        debug!(model = model_name, errors = errors.len(), "request outside trained domains");
        return (StatusCode::BAD_REQUEST, PredictionResponse::failure("Validation failed for the inputs", errors));
    }

    let raw = match model.predict(strategy.extract_feature_vector(&request)) {
        Ok(r) => r,
        Err(e) => {
            warn!(model = model_name, error = %e, "prediction failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, PredictionResponse::failure("Prediction failed", vec![e.to_string()]));
        }
    };
    match strategy.postprocess_prediction(&raw) {
        Ok(result) => (StatusCode::OK, PredictionResponse::success(result)),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, PredictionResponse::failure("Prediction failed", vec![e.to_string()])),
    }
}
