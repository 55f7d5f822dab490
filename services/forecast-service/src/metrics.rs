//! Prometheus instruments for the retrain loop and the prediction API, scraped
//! through the core health server's `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

pub struct RetrainMetrics {
    pub ticks_total: IntCounter,
    pub tick_failures_total: IntCounter,
    pub retrains_total: IntCounterVec,
    pub model_failures_total: IntCounterVec,
    pub training_seconds: HistogramVec,
    pub reloads_total: IntCounterVec,
    pub loaded_models: IntGauge,
}

pub struct ApiMetrics {
    pub predictions_total: IntCounterVec,
    pub prediction_latency_seconds: Histogram,
}

pub struct ForecastMetrics {
    pub retrain: RetrainMetrics,
    pub api: ApiMetrics,
}

// register_* only fails on a duplicate name, which would be a programming error.
pub static METRICS: Lazy<ForecastMetrics> = Lazy::new(|| ForecastMetrics {
    retrain: RetrainMetrics {
        ticks_total: register_int_counter!("kubecast_retrain_ticks_total", "Retrain ticks started").expect("metric"),
        tick_failures_total: register_int_counter!("kubecast_retrain_tick_failures_total", "Retrain ticks aborted").expect("metric"),
        retrains_total: register_int_counter_vec!("kubecast_retrains_total", "Models retrained and published", &["model"]).expect("metric"),
        model_failures_total: register_int_counter_vec!("kubecast_retrain_model_failures_total", "Per-model retrain failures", &["model", "stage"]).expect("metric"),
        training_seconds: register_histogram_vec!("kubecast_training_seconds", "Fit plus publish duration", &["model"]).expect("metric"),
        reloads_total: register_int_counter_vec!("kubecast_registry_reloads_total", "Registry reloads by outcome", &["outcome"]).expect("metric"),
        loaded_models: register_int_gauge!("kubecast_loaded_models", "Models in the serving snapshot").expect("metric"),
    },
    api: ApiMetrics {
        predictions_total: register_int_counter_vec!("kubecast_predictions_total", "Prediction requests by outcome", &["model", "status"]).expect("metric"),
        prediction_latency_seconds: register_histogram!("kubecast_prediction_latency_seconds", "Prediction handler latency").expect("metric"),
    },
});
