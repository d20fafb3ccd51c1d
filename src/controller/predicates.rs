//! Predicates deciding whether an Extension event may trigger a reconcile
//!
//! Every predicate wraps a pure check over the event's snapshots, except the
//! cluster-health predicate which reads the owning Cluster from the store.
//! A [`PredicateChain`] accepts an event only if every predicate does.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::{Extension, ExtensionClass};

use super::source::WatchEvent;
use super::store::ExtensionStore;

/// Accept/reject decision for one Extension event
#[async_trait]
pub trait Predicate: Send + Sync {
    /// Name used in debug logs when the predicate rejects
    fn name(&self) -> &'static str;

    async fn accept(&self, event: &WatchEvent<Extension>) -> bool;
}

/// Whether the extension matches the controller's type and class
///
/// An unset `class` accepts extensions of any class.
pub fn matches_type_and_class(
    extension: &Extension,
    extension_type: &str,
    class: Option<ExtensionClass>,
) -> bool {
    extension.spec.type_ == extension_type
        && class.map_or(true, |class| extension.class() == class)
}

/// Gate for annotation-driven controllers
pub fn has_operation_annotation_trigger(event: &WatchEvent<Extension>) -> bool {
    match event {
        WatchEvent::Created(ext) => ext.is_being_deleted() || ext.operation_annotation().is_some(),
        WatchEvent::Updated { old, new } => {
            if new.is_being_deleted() {
                return true;
            }
            match (old.operation_annotation(), new.operation_annotation()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(before), Some(after)) => before != after,
            }
        }
        WatchEvent::Deleted(_) | WatchEvent::Generic(_) => true,
    }
}

/// Gate for level-triggered controllers: ignore writes that left the spec alone
pub fn has_generation_changed(event: &WatchEvent<Extension>) -> bool {
    match event {
        WatchEvent::Updated { old, new } => {
            new.is_being_deleted() || old.metadata.generation != new.metadata.generation
        }
        _ => true,
    }
}

/// Accepts only extensions of the configured type and class
pub struct TypeAndClassPredicate {
    extension_type: String,
    class: Option<ExtensionClass>,
}

impl TypeAndClassPredicate {
    pub fn new(extension_type: impl Into<String>, class: Option<ExtensionClass>) -> Self {
        Self {
            extension_type: extension_type.into(),
            class,
        }
    }
}

#[async_trait]
impl Predicate for TypeAndClassPredicate {
    fn name(&self) -> &'static str {
        "type-and-class"
    }

    async fn accept(&self, event: &WatchEvent<Extension>) -> bool {
        matches_type_and_class(event.object(), &self.extension_type, self.class)
    }
}

/// Accepts only events carrying an explicit operation request or a deletion
pub struct OperationAnnotationPredicate;

#[async_trait]
impl Predicate for OperationAnnotationPredicate {
    fn name(&self) -> &'static str {
        "operation-annotation"
    }

    async fn accept(&self, event: &WatchEvent<Extension>) -> bool {
        has_operation_annotation_trigger(event)
    }
}

/// Accepts only updates that changed the object's generation
pub struct GenerationChangedPredicate;

#[async_trait]
impl Predicate for GenerationChangedPredicate {
    fn name(&self) -> &'static str {
        "generation-changed"
    }

    async fn accept(&self, event: &WatchEvent<Extension>) -> bool {
        has_generation_changed(event)
    }
}

/// Rejects extensions whose managed cluster is permanently failed
///
/// Extensions living in a namespace without a Cluster (seed and garden
/// extensions) are not gated.
pub struct ClusterNotFailedPredicate<S> {
    store: Arc<S>,
}

impl<S> ClusterNotFailedPredicate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: ExtensionStore> Predicate for ClusterNotFailedPredicate<S> {
    fn name(&self) -> &'static str {
        "cluster-not-failed"
    }

    async fn accept(&self, event: &WatchEvent<Extension>) -> bool {
        let extension = event.object();
        if extension.is_being_deleted() {
            return true;
        }
        let namespace = extension.namespace().unwrap_or_default();
        match self.store.get_cluster(&namespace).await {
            Ok(Some(cluster)) => !cluster.is_failed(),
            Ok(None) => {
                debug!("No cluster for namespace {}, not gating on cluster health", namespace);
                true
            }
            Err(e) => {
                warn!("Failed to read cluster {}: {}", namespace, e);
                false
            }
        }
    }
}

/// Predicates combined with logical AND
#[derive(Clone, Default)]
pub struct PredicateChain {
    predicates: Vec<Arc<dyn Predicate>>,
}

impl PredicateChain {
    pub fn new(predicates: Vec<Arc<dyn Predicate>>) -> Self {
        Self { predicates }
    }

    pub fn push(&mut self, predicate: Arc<dyn Predicate>) {
        self.predicates.push(predicate);
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub async fn accept(&self, event: &WatchEvent<Extension>) -> bool {
        for predicate in &self.predicates {
            if !predicate.accept(event).await {
                debug!(
                    "Predicate {} rejected event for {}",
                    predicate.name(),
                    event.object().name_any()
                );
                return false;
            }
        }
        true
    }
}

/// The event gate plus cluster health, depending on the triggering mode
pub fn default_predicates<S: ExtensionStore>(
    ignore_operation_annotation: bool,
    store: Arc<S>,
) -> Vec<Arc<dyn Predicate>> {
    let gate: Arc<dyn Predicate> = if ignore_operation_annotation {
        Arc::new(GenerationChangedPredicate)
    } else {
        Arc::new(OperationAnnotationPredicate)
    };
    vec![gate, Arc::new(ClusterNotFailedPredicate::new(store))]
}

/// Full chain for a controller: type/class first, then the defaults and extras
pub fn controller_predicates<S: ExtensionStore>(
    extension_type: &str,
    class: Option<ExtensionClass>,
    ignore_operation_annotation: bool,
    store: Arc<S>,
    extra: Vec<Arc<dyn Predicate>>,
) -> PredicateChain {
    let mut chain = PredicateChain::new(vec![Arc::new(TypeAndClassPredicate::new(
        extension_type,
        class,
    ))]);
    for predicate in default_predicates(ignore_operation_annotation, store)
        .into_iter()
        .chain(extra)
    {
        chain.push(predicate);
    }
    chain
}
