//! Finalizer handling for Extension cleanup
//!
//! Each controller owns one finalizer, `extensions.gardener.cloud/<suffix>`,
//! so controllers governing different extension types never block each
//! other's deletion. The finalizer is added before any provisioning work and
//! removed only once the actuator reports a successful deletion.

use kube::ResourceExt;
use tracing::info;

use crate::crd::Extension;
use crate::error::Result;

use super::store::ExtensionStore;

/// Prefix shared by all finalizers written by extension controllers
pub const FINALIZER_PREFIX: &str = "extensions.gardener.cloud";

/// Finalizer name for a controller: `<prefix>/<suffix>`
pub fn finalizer_name(prefix: &str, suffix: &str) -> String {
    format!("{prefix}/{suffix}")
}

/// Add the finalizer if not present, returning the current object
pub async fn add_finalizer<S: ExtensionStore + ?Sized>(
    store: &S,
    extension: Extension,
    finalizer: &str,
) -> Result<Extension> {
    if extension.has_finalizer(finalizer) {
        return Ok(extension);
    }

    let mut finalizers = extension.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let updated = store.update_finalizers(&extension, finalizers).await?;
    info!(
        "Added finalizer {} to Extension {}",
        finalizer,
        extension.name_any()
    );
    Ok(updated)
}

/// Remove the finalizer if present, returning the current object
///
/// Once the last finalizer is gone the store completes the deletion.
pub async fn remove_finalizer<S: ExtensionStore + ?Sized>(
    store: &S,
    extension: Extension,
    finalizer: &str,
) -> Result<Extension> {
    if !extension.has_finalizer(finalizer) {
        return Ok(extension);
    }

    let finalizers: Vec<String> = extension
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let updated = store.update_finalizers(&extension, finalizers).await?;
    info!(
        "Removed finalizer {} from Extension {}",
        finalizer,
        extension.name_any()
    );
    Ok(updated)
}
