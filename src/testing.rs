//! In-memory collaborators for exercising controllers without an API server

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use crate::controller::{
    Actuator, ActuatorResult, ExtensionStore, ObjectKey, Operation, Outcome,
};
use crate::crd::{Cluster, Extension, ExtensionStatus};
use crate::error::{Error, Result};

#[derive(Default)]
struct StoreState {
    extensions: BTreeMap<ObjectKey, Extension>,
    clusters: HashMap<String, Cluster>,
    resource_version: u64,
    writes: usize,
    pending_conflicts: usize,
}

impl StoreState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// Store with API-server write semantics: resourceVersion preconditions,
/// and removal of deleting objects once their last finalizer is gone
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    /// Create or replace an Extension as an external client would
    ///
    /// Assigns a fresh resourceVersion and defaults the generation to 1.
    pub fn put_extension(&self, mut extension: Extension) -> Extension {
        let mut state = self.lock();
        extension.metadata.resource_version = Some(state.next_resource_version());
        extension.metadata.generation.get_or_insert(1);
        state
            .extensions
            .insert(ObjectKey::from_resource(&extension), extension.clone());
        extension
    }

    pub fn put_cluster(&self, cluster: Cluster) {
        self.lock().clusters.insert(cluster.name_any(), cluster);
    }

    pub fn extension(&self, key: &ObjectKey) -> Option<Extension> {
        self.lock().extensions.get(key).cloned()
    }

    /// Successful writes performed through the store trait
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Reject the next `n` writes with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.lock().pending_conflicts = n;
    }

    /// Set the deletion timestamp, or remove the object when nothing holds it
    pub fn request_deletion(&self, key: &ObjectKey) -> Option<Extension> {
        let mut state = self.lock();
        let rv = state.next_resource_version();
        let extension = state.extensions.get_mut(key)?;
        if extension.finalizers().is_empty() {
            return state.extensions.remove(key);
        }
        extension
            .metadata
            .deletion_timestamp
            .get_or_insert_with(|| Time(chrono::Utc::now()));
        extension.metadata.resource_version = Some(rv);
        Some(extension.clone())
    }

    fn write(&self, extension: &Extension, mutate: impl FnOnce(&mut Extension)) -> Result<Extension> {
        let mut state = self.lock();
        let key = ObjectKey::from_resource(extension);
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(Error::Conflict(key.to_string()));
        }
        let Some(current) = state.extensions.get(&key) else {
            return Err(Error::NotFound(key.to_string()));
        };
        if current.resource_version() != extension.resource_version() {
            return Err(Error::Conflict(key.to_string()));
        }

        let mut updated = current.clone();
        mutate(&mut updated);
        updated.metadata.resource_version = Some(state.next_resource_version());
        state.writes += 1;

        if updated.is_being_deleted() && updated.finalizers().is_empty() {
            state.extensions.remove(&key);
        } else {
            state.extensions.insert(key, updated.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl ExtensionStore for MemoryStore {
    async fn get_extension(&self, key: &ObjectKey) -> Result<Option<Extension>> {
        Ok(self.extension(key))
    }

    async fn list_extensions(&self) -> Result<Vec<Extension>> {
        Ok(self.lock().extensions.values().cloned().collect())
    }

    async fn get_cluster(&self, namespace: &str) -> Result<Option<Cluster>> {
        Ok(self.lock().clusters.get(namespace).cloned())
    }

    async fn update_finalizers(
        &self,
        extension: &Extension,
        finalizers: Vec<String>,
    ) -> Result<Extension> {
        self.write(extension, |ext| ext.metadata.finalizers = Some(finalizers))
    }

    async fn remove_annotation(&self, extension: &Extension, annotation: &str) -> Result<Extension> {
        self.write(extension, |ext| {
            ext.annotations_mut().remove(annotation);
        })
    }

    async fn update_status(
        &self,
        extension: &Extension,
        status: &ExtensionStatus,
    ) -> Result<Extension> {
        self.write(extension, |ext| ext.status = Some(status.clone()))
    }
}

/// One recorded actuator invocation
#[derive(Clone, Debug)]
pub struct ActuatorCall {
    pub operation: Operation,
    pub extension: Extension,
}

#[derive(Default)]
struct Script {
    responses: HashMap<Operation, VecDeque<ActuatorResult>>,
    calls: Vec<ActuatorCall>,
}

/// Actuator replaying queued results per operation; succeeds once a queue is empty
#[derive(Default)]
pub struct ScriptedActuator {
    script: Mutex<Script>,
}

impl ScriptedActuator {
    /// Queue the result of the next `operation` call
    pub fn respond(&self, operation: Operation, result: ActuatorResult) {
        self.script
            .lock()
            .unwrap()
            .responses
            .entry(operation)
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.calls().into_iter().map(|call| call.operation).collect()
    }

    fn next(&self, operation: Operation, extension: &Extension) -> ActuatorResult {
        let mut script = self.script.lock().unwrap();
        script.calls.push(ActuatorCall {
            operation,
            extension: extension.clone(),
        });
        script
            .responses
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Outcome::done()))
    }
}

#[async_trait]
impl Actuator for ScriptedActuator {
    async fn reconcile(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        self.next(Operation::Reconcile, extension)
    }

    async fn delete(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        self.next(Operation::Delete, extension)
    }

    async fn force_delete(
        &self,
        extension: &Extension,
        _cluster: Option<&Cluster>,
    ) -> ActuatorResult {
        self.next(Operation::ForceDelete, extension)
    }

    async fn migrate(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        self.next(Operation::Migrate, extension)
    }

    async fn restore(&self, extension: &Extension, _cluster: Option<&Cluster>) -> ActuatorResult {
        self.next(Operation::Restore, extension)
    }
}
