//! Statistics endpoints exposing the admission monitor.

use std::sync::Arc;

use ::rate_limit::{MonitorSnapshot, RateLimiterService};
use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use config::StatsConfig;

pub(crate) fn router(config: &StatsConfig, service: Arc<RateLimiterService>) -> Router {
    Router::new()
        .route(&config.path, get(snapshot))
        .route(&format!("{}/reset", config.path), post(reset))
        .with_state(service)
}

async fn snapshot(State(service): State<Arc<RateLimiterService>>) -> Json<MonitorSnapshot> {
    Json(service.monitor().snapshot())
}

#[derive(Debug, serde::Serialize)]
struct ResetResponse {
    status: &'static str,
}

/// Clears the monitor aggregates. Counter records in the shared store
/// are untouched; a request right after a reset still runs against its
/// existing window.
async fn reset(State(service): State<Arc<RateLimiterService>>) -> Json<ResetResponse> {
    service.monitor().reset();

    log::info!("Admission statistics reset");

    Json(ResetResponse { status: "reset" })
}
