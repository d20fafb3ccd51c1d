//! Axum HTTP server for health checks and metrics

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{Error, Result};

use super::handlers;

/// State shared with the handlers
#[derive(Clone)]
pub struct ApiState {
    pub leader: watch::Receiver<bool>,
}

/// Routes served by the operator
pub fn router(state: ApiState) -> Router {
    let router = Router::new().route("/health", get(handlers::health));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve the health and metrics endpoints until `shutdown` flips to true
pub async fn run_server(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
