//! Controller module for Extension reconciliation
//! This module contains the event filtering, the reconciliation state
//! machine and the wiring that runs them on the kube controller runtime.

mod actuator;
mod backoff;
mod dispatch;
mod finalizers;
mod mapper;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod predicates;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod source;
mod store;

pub use actuator::{
    Actuator, ActuatorError, ActuatorResult, ErrorKind, NoopActuator, Outcome,
};
pub use backoff::BackoffConfig;
pub use dispatch::{
    run_controller, ControllerArgs, ExtensionController, DEFAULT_MAX_CONCURRENT_RECONCILES,
    DEFAULT_RECONCILE_TIMEOUT, DEFAULT_RESYNC,
};
pub use finalizers::{finalizer_name, FINALIZER_PREFIX};
pub use mapper::{cluster_to_extension_keys, ClusterToExtensionMapper};
pub use predicates::{default_predicates, Predicate, PredicateChain};
pub use reconciler::{Operation, Reconciler};
pub use source::{watch_events, EventTracker, WatchEvent};
pub use store::{ExtensionStore, KubeStore, ObjectKey};
