//! Extension Custom Resource Definition
//!
//! An Extension declares a unit of provider-specific infrastructure attached
//! to a managed cluster. The `type` field selects the controller responsible
//! for it; the `class` field selects the tier it applies to.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ExtensionClass, LastError, LastOperation, LastOperationState, ANNOTATION_FORCE_DELETION,
    ANNOTATION_OPERATION,
};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Extension",
    namespaced,
    status = "ExtensionStatus",
    shortname = "ext",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Class","type":"string","jsonPath":".spec.class"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
    /// Provider discriminator, matched against the controller's configured type
    #[serde(rename = "type")]
    pub type_: String,

    /// Tier this extension applies to; unset means shoot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ExtensionClass>,

    /// Opaque provider configuration passed through to the actuator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub provider_config: Option<serde_json::Value>,
}

/// Observed state of an Extension
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ExtensionStatus {
    /// Equality ignoring update timestamps
    pub fn same_as(&self, other: &ExtensionStatus) -> bool {
        fn same<T>(a: &Option<T>, b: &Option<T>, eq: impl Fn(&T, &T) -> bool) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => eq(a, b),
                (None, None) => true,
                _ => false,
            }
        }

        same(&self.last_operation, &other.last_operation, LastOperation::same_as)
            && same(&self.last_error, &other.last_error, LastError::same_as)
            && self.observed_generation == other.observed_generation
    }
}

impl Extension {
    /// The class this extension applies to, defaulting to shoot
    pub fn class(&self) -> ExtensionClass {
        self.spec.class.unwrap_or_default()
    }

    /// The pending operation annotation, if present and non-empty
    pub fn operation_annotation(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_OPERATION)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Whether deletion has been requested
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the given finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Whether the force-deletion annotation is set to "true"
    pub fn is_force_deletion_confirmed(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_FORCE_DELETION)
            .is_some_and(|v| v == "true")
    }

    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.status.as_ref().and_then(|s| s.last_operation.as_ref())
    }

    /// Whether the last attempt ended in an error that is not retried automatically
    pub fn has_terminal_failure(&self) -> bool {
        let failed = self
            .last_operation()
            .is_some_and(|op| op.state == LastOperationState::Failed);
        let terminal_error = self
            .status
            .as_ref()
            .and_then(|s| s.last_error.as_ref())
            .is_some_and(|e| !e.retriable);
        failed || terminal_error
    }
}
