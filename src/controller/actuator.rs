//! Actuator interface implemented by provider-specific extension logic
//!
//! The controller decides *which* operation to run; the actuator performs it.
//! Each controller is constructed with exactly one actuator type, so dispatch
//! is resolved at compile time through the controller's generic parameter.

use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use thiserror::Error;
use tracing::info;

use crate::crd::{Cluster, Extension};

/// Successful operation result
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Ask the controller to run the operation again after this delay
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    /// Operation finished; nothing further to schedule
    pub fn done() -> Self {
        Self::default()
    }

    /// Operation finished but should be revisited after `delay`
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Whether an actuator failure may succeed on retry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Retriable,
    /// Cannot succeed without an external change
    Terminal,
}

/// Failure reported by an actuator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ActuatorError {
    kind: ErrorKind,
    message: String,
    requeue_after: Option<Duration>,
}

impl ActuatorError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retriable,
            message: message.into(),
            requeue_after: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
            requeue_after: None,
        }
    }

    /// Override the backoff delay for this failure
    pub fn with_requeue_after(mut self, delay: Duration) -> Self {
        self.requeue_after = Some(delay);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::Retriable
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Provider errors are retriable unless the provider says otherwise.
impl From<anyhow::Error> for ActuatorError {
    fn from(err: anyhow::Error) -> Self {
        ActuatorError::retriable(format!("{err:#}"))
    }
}

pub type ActuatorResult = std::result::Result<Outcome, ActuatorError>;

/// Provider-specific operations for one extension type
///
/// Every method receives the current Extension snapshot and the owning
/// Cluster, when one exists.
#[async_trait]
pub trait Actuator: Send + Sync + 'static {
    /// Bring the provider's infrastructure in line with the extension spec
    async fn reconcile(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult;

    /// Tear down everything the extension created
    async fn delete(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult;

    /// Tear down without waiting for graceful cleanup
    ///
    /// Defaults to [`Actuator::delete`].
    async fn force_delete(
        &self,
        extension: &Extension,
        cluster: Option<&Cluster>,
    ) -> ActuatorResult {
        self.delete(extension, cluster).await
    }

    /// Release hosting-side state before the managed cluster moves away
    async fn migrate(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult;

    /// Recreate hosting-side state after the managed cluster moved in
    async fn restore(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult;
}

/// Share one actuator between controllers
#[async_trait]
impl<T: Actuator> Actuator for std::sync::Arc<T> {
    async fn reconcile(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult {
        (**self).reconcile(extension, cluster).await
    }

    async fn delete(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult {
        (**self).delete(extension, cluster).await
    }

    async fn force_delete(
        &self,
        extension: &Extension,
        cluster: Option<&Cluster>,
    ) -> ActuatorResult {
        (**self).force_delete(extension, cluster).await
    }

    async fn migrate(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult {
        (**self).migrate(extension, cluster).await
    }

    async fn restore(&self, extension: &Extension, cluster: Option<&Cluster>) -> ActuatorResult {
        (**self).restore(extension, cluster).await
    }
}

/// Actuator that accepts every operation without touching any infrastructure
///
/// Used by the bundled operator binary to exercise the lifecycle machinery
/// (finalizers, annotations, status) against a real cluster.
#[derive(Clone, Debug, Default)]
pub struct NoopActuator;

#[async_trait]
impl Actuator for NoopActuator {
    async fn reconcile(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        info!("noop reconcile of extension {}", extension.name_any());
        Ok(Outcome::done())
    }

    async fn delete(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        info!("noop delete of extension {}", extension.name_any());
        Ok(Outcome::done())
    }

    async fn migrate(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        info!("noop migrate of extension {}", extension.name_any());
        Ok(Outcome::done())
    }

    async fn restore(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        info!("noop restore of extension {}", extension.name_any());
        Ok(Outcome::done())
    }
}
