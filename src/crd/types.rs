//! Shared types for extension and cluster resources
//!
//! These types are used across the CRD definitions and controller logic.
//!
//! # Type Hierarchy
//!
//! - [`ExtensionClass`] - Which tier an extension applies to (shoot, seed, garden)
//! - [`LastOperation`] - Last operation performed on a resource, with its state
//! - [`LastError`] - Last error observed while reconciling a resource
//! - Wire constants for the operation and force-deletion annotations

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation carrying an explicit operation request
pub const ANNOTATION_OPERATION: &str = "gardener.cloud/operation";

/// Operation annotation value requesting a reconcile
pub const OPERATION_RECONCILE: &str = "reconcile";

/// Operation annotation value requesting a migration
pub const OPERATION_MIGRATE: &str = "migrate";

/// Operation annotation value requesting a restore
pub const OPERATION_RESTORE: &str = "restore";

/// Annotation confirming that deletion may skip graceful cleanup
pub const ANNOTATION_FORCE_DELETION: &str = "confirmation.gardener.cloud/force-deletion";

/// Tier an extension is responsible for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionClass {
    /// Managed (shoot) cluster tier
    #[default]
    Shoot,
    /// Hosting (seed) cluster tier
    Seed,
    /// Garden runtime tier
    Garden,
}

impl std::fmt::Display for ExtensionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtensionClass::Shoot => write!(f, "shoot"),
            ExtensionClass::Seed => write!(f, "seed"),
            ExtensionClass::Garden => write!(f, "garden"),
        }
    }
}

impl std::str::FromStr for ExtensionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shoot" => Ok(ExtensionClass::Shoot),
            "seed" => Ok(ExtensionClass::Seed),
            "garden" => Ok(ExtensionClass::Garden),
            other => Err(format!(
                "unknown extension class '{other}' (expected shoot, seed or garden)"
            )),
        }
    }
}

/// Kind of operation recorded in a status block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum LastOperationType {
    Create,
    Reconcile,
    Delete,
    Migrate,
    Restore,
}

impl std::fmt::Display for LastOperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LastOperationType::Create => "Create",
            LastOperationType::Reconcile => "Reconcile",
            LastOperationType::Delete => "Delete",
            LastOperationType::Migrate => "Migrate",
            LastOperationType::Restore => "Restore",
        };
        f.write_str(s)
    }
}

/// Progress state of the last operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum LastOperationState {
    Pending,
    Processing,
    Succeeded,
    /// Failed with a retriable error
    Error,
    /// Failed permanently; no automatic retry
    Failed,
    Aborted,
}

/// Last operation performed on a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    #[serde(rename = "type")]
    pub type_: LastOperationType,
    pub state: LastOperationState,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub progress: i32,
    /// RFC 3339 timestamp of the last update
    #[serde(default)]
    pub last_update_time: String,
}

impl LastOperation {
    pub fn new(
        type_: LastOperationType,
        state: LastOperationState,
        description: impl Into<String>,
    ) -> Self {
        let progress = match state {
            LastOperationState::Succeeded => 100,
            LastOperationState::Processing => 1,
            _ => 0,
        };
        Self {
            type_,
            state,
            description: description.into(),
            progress,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Equality ignoring the update timestamp
    pub fn same_as(&self, other: &LastOperation) -> bool {
        self.type_ == other.type_
            && self.state == other.state
            && self.description == other.description
            && self.progress == other.progress
    }
}

/// Last error observed while reconciling a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub description: String,
    /// Whether the controller will retry automatically
    #[serde(default)]
    pub retriable: bool,
    /// RFC 3339 timestamp of the last update
    #[serde(default)]
    pub last_update_time: String,
}

impl LastError {
    pub fn new(description: impl Into<String>, retriable: bool) -> Self {
        Self {
            description: description.into(),
            retriable,
            last_update_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Equality ignoring the update timestamp
    pub fn same_as(&self, other: &LastError) -> bool {
        self.description == other.description && self.retriable == other.retriable
    }
}
