//! HTTP endpoints for health checks and scraping
//!
//! Serves `/health` for liveness and readiness checks and, with the `metrics`
//! feature, `/metrics` in the Prometheus text format.

mod handlers;
mod server;

pub use handlers::HealthResponse;
pub use server::{router, run_server, ApiState};
