use axum::Json;
use http::StatusCode;

#[derive(Debug, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum HealthState {
    /// Indicates that the gateway is healthy and operational.
    Healthy,
}

/// Handles health check requests and returns the current health status
/// of the gateway.
pub(crate) async fn health() -> (StatusCode, Json<HealthState>) {
    (StatusCode::OK, Json(HealthState::Healthy))
}
