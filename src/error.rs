//! Error types for the extension controller

use std::time::Duration;

use thiserror::Error;

use crate::controller::ActuatorError;

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the controller machinery
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Optimistic-lock rejection: the object changed since it was read
    #[error("Conflict writing {0}: object was modified concurrently")]
    Conflict(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Reconcile of {key} exceeded deadline of {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A reflector cache lost the watch that feeds it
    #[error("Watch error: {0}")]
    WatchError(String),
}

impl Error {
    /// Whether the failed attempt should be retried with backoff
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(e) => !matches!(e, kube::Error::Api(ae) if ae.code == 400 || ae.code == 422),
            Error::Conflict(_)
            | Error::NotFound(_)
            | Error::Timeout { .. }
            | Error::WatchError(_) => true,
            Error::Actuator(e) => e.is_retriable(),
            Error::ConfigError(_) | Error::SerializationError(_) => false,
        }
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }

    /// Explicit retry delay requested by the actuator, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::Actuator(e) => e.requeue_after(),
            _ => None,
        }
    }

    /// Short category label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Timeout { .. } => "timeout",
            Error::Actuator(e) if e.is_retriable() => "actuator",
            Error::Actuator(_) => "actuator_terminal",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::WatchError(_) => "watch",
        }
    }
}
