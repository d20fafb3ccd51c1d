//! Resource store access used by the reconciler
//!
//! Reads are served from the controller's reflector caches. All writes are
//! conditional on the resourceVersion of the snapshot they were derived from.
//! A stale snapshot yields [`Error::Conflict`] so the caller re-reads instead
//! of clobbering a concurrent edit.

use std::fmt;

use async_trait::async_trait;
use kube::{
    api::{Api, Patch, PatchParams},
    client::Client,
    runtime::reflector::{ObjectRef, Store},
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::debug;

use crate::crd::{Cluster, Extension, ExtensionStatus};
use crate::error::{Error, Result};

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    /// Reference used by the runtime's scheduler and reflector caches
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read and conditionally write Extension and Cluster resources
#[async_trait]
pub trait ExtensionStore: Send + Sync + 'static {
    /// Fetch an Extension, `None` if it no longer exists
    async fn get_extension(&self, key: &ObjectKey) -> Result<Option<Extension>>;

    /// List Extensions across all namespaces
    async fn list_extensions(&self) -> Result<Vec<Extension>>;

    /// Fetch the Cluster owning the given namespace
    async fn get_cluster(&self, namespace: &str) -> Result<Option<Cluster>>;

    /// Replace the finalizer list, returning the updated object
    async fn update_finalizers(
        &self,
        extension: &Extension,
        finalizers: Vec<String>,
    ) -> Result<Extension>;

    /// Remove one annotation, returning the updated object
    async fn remove_annotation(&self, extension: &Extension, annotation: &str)
        -> Result<Extension>;

    /// Replace the status block, returning the updated object
    async fn update_status(
        &self,
        extension: &Extension,
        status: &ExtensionStatus,
    ) -> Result<Extension>;
}

/// Store backed by the Kubernetes API server
///
/// Reads come from reflector caches filled by the controller's watches;
/// writes go straight to the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
    extensions: Store<Extension>,
    clusters: Store<Cluster>,
}

impl KubeStore {
    pub fn new(
        client: Client,
        field_manager: impl Into<String>,
        extensions: Store<Extension>,
        clusters: Store<Cluster>,
    ) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            extensions,
            clusters,
        }
    }

    fn extensions(&self, extension: &Extension) -> Api<Extension> {
        let namespace = extension
            .namespace()
            .unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }
}

/// Block until the initial list of a cache has completed
async fn wait_for_cache<K>(cache: &Store<K>, kind: &str) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    cache
        .wait_until_ready()
        .await
        .map_err(|_| Error::WatchError(format!("{kind} cache is no longer fed by a watch")))
}

/// Map 409 and 404 from the API server onto [`Error::Conflict`] and [`Error::NotFound`]
fn write_error(extension: &Extension, err: kube::Error) -> Error {
    let key = ObjectKey::from_resource(extension).to_string();
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict(key),
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(key),
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl ExtensionStore for KubeStore {
    async fn get_extension(&self, key: &ObjectKey) -> Result<Option<Extension>> {
        wait_for_cache(&self.extensions, "Extension").await?;
        Ok(self
            .extensions
            .get(&key.object_ref())
            .map(|extension| Extension::clone(&extension)))
    }

    async fn list_extensions(&self) -> Result<Vec<Extension>> {
        wait_for_cache(&self.extensions, "Extension").await?;
        Ok(self
            .extensions
            .state()
            .into_iter()
            .map(|extension| Extension::clone(&extension))
            .collect())
    }

    async fn get_cluster(&self, namespace: &str) -> Result<Option<Cluster>> {
        wait_for_cache(&self.clusters, "Cluster").await?;
        Ok(self
            .clusters
            .get(&ObjectRef::new(namespace))
            .map(|cluster| Cluster::clone(&cluster)))
    }

    async fn update_finalizers(
        &self,
        extension: &Extension,
        finalizers: Vec<String>,
    ) -> Result<Extension> {
        let patch = json!({
            "metadata": {
                "resourceVersion": extension.resource_version(),
                "finalizers": finalizers,
            }
        });
        debug!("Patching finalizers of {}", extension.name_any());
        self.extensions(extension)
            .patch(
                &extension.name_any(),
                &self.patch_params(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| write_error(extension, e))
    }

    async fn remove_annotation(
        &self,
        extension: &Extension,
        annotation: &str,
    ) -> Result<Extension> {
        // null deletes the key under JSON merge patch semantics
        let patch = json!({
            "metadata": {
                "resourceVersion": extension.resource_version(),
                "annotations": { annotation: null },
            }
        });
        self.extensions(extension)
            .patch(
                &extension.name_any(),
                &self.patch_params(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| write_error(extension, e))
    }

    async fn update_status(
        &self,
        extension: &Extension,
        status: &ExtensionStatus,
    ) -> Result<Extension> {
        let mut status = serde_json::to_value(status)?;
        if let Some(fields) = status.as_object_mut() {
            // Omitted fields would survive a merge patch; clear them explicitly
            for field in ["lastOperation", "lastError", "observedGeneration"] {
                fields
                    .entry(field)
                    .or_insert(serde_json::Value::Null);
            }
        }
        let patch = json!({
            "metadata": { "resourceVersion": extension.resource_version() },
            "status": status,
        });
        self.extensions(extension)
            .patch_status(
                &extension.name_any(),
                &self.patch_params(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| write_error(extension, e))
    }
}
