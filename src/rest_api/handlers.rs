//! HTTP handlers for the health and metrics endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::server::ApiState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether this replica currently runs the controllers
    pub leader: bool,
}

/// Health check endpoint
///
/// Reports healthy on every replica; standby replicas only differ in `leader`.
#[instrument(skip(state))]
pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            leader: *state.leader.borrow(),
        }),
    )
}

/// Prometheus text exposition of the controller metrics
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, StatusCode> {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    encode(&mut buffer, &crate::controller::metrics::REGISTRY)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}
