//! Reconciliation state machine for Extension resources
//!
//! The operation to run is derived from the current snapshot only: the
//! deletion timestamp and the operation annotation. Nothing about previous
//! events is remembered between attempts.

use std::fmt;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::crd::{
    Cluster, Extension, ExtensionStatus, LastError, LastOperation, LastOperationState,
    LastOperationType, ANNOTATION_OPERATION, OPERATION_MIGRATE, OPERATION_RESTORE,
};
use crate::error::{Error, Result};

use super::actuator::{Actuator, ActuatorError, ActuatorResult};
use super::finalizers::{add_finalizer, remove_finalizer};
use super::store::{ExtensionStore, ObjectKey};

/// Operation selected for one reconcile attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Reconcile,
    Delete,
    ForceDelete,
    Migrate,
    Restore,
}

impl Operation {
    /// Classify the current snapshot; deletion wins over any annotation
    pub fn for_extension(extension: &Extension, cluster: Option<&Cluster>) -> Self {
        if extension.is_being_deleted() {
            let forced = extension.is_force_deletion_confirmed()
                || cluster.is_some_and(Cluster::is_force_deletion_confirmed);
            return if forced {
                Operation::ForceDelete
            } else {
                Operation::Delete
            };
        }
        match extension.operation_annotation() {
            Some(OPERATION_MIGRATE) => Operation::Migrate,
            Some(OPERATION_RESTORE) => Operation::Restore,
            _ => Operation::Reconcile,
        }
    }

    pub fn is_deletion(self) -> bool {
        matches!(self, Operation::Delete | Operation::ForceDelete)
    }

    /// Operation type recorded in the status block
    pub fn last_operation_type(self) -> LastOperationType {
        match self {
            Operation::Reconcile => LastOperationType::Reconcile,
            Operation::Delete | Operation::ForceDelete => LastOperationType::Delete,
            Operation::Migrate => LastOperationType::Migrate,
            Operation::Restore => LastOperationType::Restore,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Reconcile => "Reconcile",
            Operation::Delete => "Delete",
            Operation::ForceDelete => "ForceDelete",
            Operation::Migrate => "Migrate",
            Operation::Restore => "Restore",
        };
        f.write_str(s)
    }
}

/// Drives one Extension toward its desired state through the actuator
pub struct Reconciler<A, S> {
    controller: String,
    actuator: A,
    store: Arc<S>,
    finalizer: String,
    ignore_operation_annotation: bool,
}

impl<A: Actuator, S: ExtensionStore> Reconciler<A, S> {
    pub fn new(
        controller: impl Into<String>,
        actuator: A,
        store: Arc<S>,
        finalizer: impl Into<String>,
        ignore_operation_annotation: bool,
    ) -> Self {
        Self {
            controller: controller.into(),
            actuator,
            store,
            finalizer: finalizer.into(),
            ignore_operation_annotation,
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Run one attempt for `key` against the current state in the store
    #[instrument(skip(self), fields(controller = %self.controller, namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(extension) = self.store.get_extension(key).await? else {
            debug!("Extension {} no longer exists", key);
            return Ok(Action::await_change());
        };
        let cluster = self.store.get_cluster(&key.namespace).await?;
        let operation = Operation::for_extension(&extension, cluster.as_ref());

        info!(
            "Reconciling Extension {} (type: {}, operation: {})",
            key, extension.spec.type_, operation
        );

        if operation.is_deletion() {
            self.delete(extension, cluster.as_ref(), operation).await
        } else {
            self.apply(extension, cluster.as_ref(), operation).await
        }
    }

    async fn apply(
        &self,
        extension: Extension,
        cluster: Option<&Cluster>,
        operation: Operation,
    ) -> Result<Action> {
        // The finalizer must be in place before the actuator creates anything
        let extension = add_finalizer(self.store.as_ref(), extension, &self.finalizer).await?;
        let extension = self.record_processing(extension, operation).await?;

        match self.invoke(operation, &extension, cluster).await {
            Ok(outcome) => {
                let name = extension.name_any();
                let extension = self.record_success(extension, operation).await?;
                if self.clears_annotation(operation) {
                    self.clear_operation_annotation(extension).await?;
                }
                info!("{} of Extension {} succeeded", operation, name);
                Ok(outcome
                    .requeue_after
                    .map_or_else(Action::await_change, Action::requeue))
            }
            Err(err) => {
                self.record_error(extension, operation, &err).await?;
                Err(Error::Actuator(err))
            }
        }
    }

    async fn delete(
        &self,
        extension: Extension,
        cluster: Option<&Cluster>,
        operation: Operation,
    ) -> Result<Action> {
        let name = extension.name_any();
        if !extension.has_finalizer(&self.finalizer) {
            debug!("Extension {} has no finalizer {}, nothing to clean up", name, self.finalizer);
            return Ok(Action::await_change());
        }

        // Resources were handed over to another hosting cluster; nothing left to delete here
        let migrated = extension.last_operation().is_some_and(|op| {
            op.type_ == LastOperationType::Migrate && op.state == LastOperationState::Succeeded
        });
        if migrated {
            info!("Extension {} was migrated, skipping actuator deletion", name);
            remove_finalizer(self.store.as_ref(), extension, &self.finalizer).await?;
            return Ok(Action::await_change());
        }

        let extension = self.record_processing(extension, operation).await?;
        match self.invoke(operation, &extension, cluster).await {
            Ok(outcome) => {
                if let Some(delay) = outcome.requeue_after {
                    info!("Deletion of Extension {} still in progress, checking again in {:?}", name, delay);
                    return Ok(Action::requeue(delay));
                }
                let extension = self.record_success(extension, operation).await?;
                remove_finalizer(self.store.as_ref(), extension, &self.finalizer).await?;
                info!("Deletion of Extension {} complete", name);
                Ok(Action::await_change())
            }
            Err(err) => {
                warn!("Deletion of Extension {} failed: {}", name, err);
                self.record_error(extension, operation, &err).await?;
                Err(Error::Actuator(err))
            }
        }
    }

    async fn invoke(
        &self,
        operation: Operation,
        extension: &Extension,
        cluster: Option<&Cluster>,
    ) -> ActuatorResult {
        match operation {
            Operation::Reconcile => self.actuator.reconcile(extension, cluster).await,
            Operation::Delete => self.actuator.delete(extension, cluster).await,
            Operation::ForceDelete => self.actuator.force_delete(extension, cluster).await,
            Operation::Migrate => self.actuator.migrate(extension, cluster).await,
            Operation::Restore => self.actuator.restore(extension, cluster).await,
        }
    }

    fn clears_annotation(&self, operation: Operation) -> bool {
        match operation {
            Operation::Migrate | Operation::Restore => true,
            Operation::Reconcile => !self.ignore_operation_annotation,
            Operation::Delete | Operation::ForceDelete => false,
        }
    }

    /// Remove the operation annotation; a no-op when it is already absent
    async fn clear_operation_annotation(&self, extension: Extension) -> Result<Extension> {
        if !extension.annotations().contains_key(ANNOTATION_OPERATION) {
            return Ok(extension);
        }
        self.store
            .remove_annotation(&extension, ANNOTATION_OPERATION)
            .await
    }

    /// Mark a new operation as in progress
    ///
    /// Retries of an operation that is already processing or erroring keep
    /// the existing status, so repeated failures do not rewrite it.
    async fn record_processing(
        &self,
        extension: Extension,
        operation: Operation,
    ) -> Result<Extension> {
        let type_ = operation.last_operation_type();
        let retrying = extension.last_operation().is_some_and(|op| {
            op.type_ == type_
                && matches!(
                    op.state,
                    LastOperationState::Processing | LastOperationState::Error
                )
        });
        if retrying {
            return Ok(extension);
        }

        let mut status = extension.status.clone().unwrap_or_default();
        status.last_operation = Some(LastOperation::new(
            type_,
            LastOperationState::Processing,
            format!("Processing {operation} of extension"),
        ));
        self.write_status(extension, status).await
    }

    async fn record_success(&self, extension: Extension, operation: Operation) -> Result<Extension> {
        let mut status = extension.status.clone().unwrap_or_default();
        status.last_operation = Some(LastOperation::new(
            operation.last_operation_type(),
            LastOperationState::Succeeded,
            format!("{operation} of extension succeeded"),
        ));
        status.last_error = None;
        if !operation.is_deletion() {
            status.observed_generation = extension.metadata.generation;
        }
        self.write_status(extension, status).await
    }

    async fn record_error(
        &self,
        extension: Extension,
        operation: Operation,
        err: &ActuatorError,
    ) -> Result<Extension> {
        let state = if err.is_retriable() {
            LastOperationState::Error
        } else {
            LastOperationState::Failed
        };
        let mut status = extension.status.clone().unwrap_or_default();
        status.last_operation = Some(LastOperation::new(
            operation.last_operation_type(),
            state,
            format!("{operation} of extension failed: {}", err.message()),
        ));
        status.last_error = Some(LastError::new(err.message(), err.is_retriable()));
        self.write_status(extension, status).await
    }

    /// Write the status unless it matches what is already stored
    async fn write_status(&self, extension: Extension, status: ExtensionStatus) -> Result<Extension> {
        if extension
            .status
            .as_ref()
            .is_some_and(|current| current.same_as(&status))
        {
            return Ok(extension);
        }
        self.store.update_status(&extension, &status).await
    }
}
