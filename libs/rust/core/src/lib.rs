//! Core shared utilities for kubecast services: tracing, layered config,
//! health/readiness endpoints and the Prometheus scrape handler.

use anyhow::Result;
use axum::{http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::RwLock;
use prometheus::{Encoder, TextEncoder};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);
static STATUS_DETAIL: Lazy<RwLock<serde_json::Map<String, serde_json::Value>>> = Lazy::new(|| RwLock::new(serde_json::Map::new()));

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }
pub fn is_ready() -> bool { NODE_READINESS.load(Ordering::SeqCst) }

/// Publish a key under `/status` (e.g. startup phase, loaded model count).
pub fn set_status_detail(key: &str, value: impl Into<serde_json::Value>) {
    STATUS_DETAIL.write().insert(key.to_string(), value.into());
}

pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("KUBECAST_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false))
                .try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "kubecast", service, "tracing initialized");
    Ok(())
}

/// Layered configuration: defaults (serde) -> optional file named by
/// `KUBECAST_CONFIG_FILE` -> `KUBECAST__*` environment variables.
pub fn load_config<T: DeserializeOwned>(service: &str) -> Result<T> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?;
    if let Ok(file) = std::env::var("KUBECAST_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("KUBECAST").prefix_separator("__").separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

pub fn health_router() -> Router {
    Router::new()
        .route("/live", get(|| async { axum::Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(ready_handler))
        .route("/status", get(|| async {
            let mut body = STATUS_DETAIL.read().clone();
            body.insert("live".into(), NODE_LIVENESS.load(Ordering::SeqCst).into());
            body.insert("ready".into(), NODE_READINESS.load(Ordering::SeqCst).into());
            axum::Json(serde_json::Value::Object(body))
        }))
        .route("/metrics", get(metrics_handler))
}

pub async fn start_health_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health_router()).await {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(())
}

async fn ready_handler() -> impl IntoResponse {
    let ready = NODE_READINESS.load(Ordering::SeqCst);
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, axum::Json(serde_json::json!({"ready": ready})))
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], format!("encode error: {e}").into_bytes());
    }
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf)
}

mod resilience;
pub use resilience::{retry_async, RetryConfig};
pub mod lifecycle;
pub use lifecycle::{StartupPhase, StartupState};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Sample { service_name: String, #[serde(default)] port: u16 }

    #[test]
    fn config_defaults_service_name() {
        let cfg: Sample = load_config("sample-service").unwrap();
        assert_eq!(cfg.service_name, "sample-service");
        assert_eq!(cfg.port, 0);
    }

    #[tokio::test]
    async fn readiness_reports_unavailable_until_marked() {
        clear_ready();
        let resp = ready_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        mark_ready();
        let resp = ready_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        clear_ready();
    }

    #[tokio::test]
    async fn metrics_handler_encodes_text() {
        let resp = metrics_handler().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
