//! Cluster Custom Resource Definition
//!
//! A Cluster carries snapshots of a managed cluster's own desired and observed
//! state. Its name equals the namespace that hosts the managed cluster's
//! extensions. The controller only ever reads it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{LastOperationState, LastOperationType, ANNOTATION_FORCE_DELETION};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Snapshot of the managed cluster
    #[serde(default)]
    pub shoot: ShootSnapshot,

    /// Snapshot of the hosting cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub seed: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub cloud_profile: Option<serde_json::Value>,
}

/// Embedded copy of the managed cluster object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootSnapshot {
    #[serde(default)]
    pub metadata: SnapshotMetadata,

    /// Desired state of the managed cluster, opaque to this controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub spec: Option<serde_json::Value>,

    #[serde(default)]
    pub status: ShootStatus,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub generation: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<ShootLastOperation>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShootLastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
}

impl Cluster {
    /// A managed cluster is permanently failed when its last operation failed
    /// and no newer desired state has been submitted since.
    pub fn is_failed(&self) -> bool {
        let shoot = &self.spec.shoot;
        shoot
            .status
            .last_operation
            .as_ref()
            .is_some_and(|op| op.state == LastOperationState::Failed)
            && shoot.metadata.generation == shoot.status.observed_generation
    }

    /// Whether the managed cluster carries a force-deletion confirmation
    pub fn is_force_deletion_confirmed(&self) -> bool {
        self.spec
            .shoot
            .metadata
            .annotations
            .get(ANNOTATION_FORCE_DELETION)
            .is_some_and(|v| v == "true")
    }
}
