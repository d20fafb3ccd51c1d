//! Maps Cluster changes onto the Extensions they affect
//!
//! A controller handles a single extension type, and an Extension of that type
//! is named after it, so a Cluster maps to at most one Extension per
//! controller: `(cluster name, extension type)`.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crd::Cluster;

use super::predicates::PredicateChain;
use super::store::ObjectKey;
use super::source::WatchEvent;
use super::store::ExtensionStore;

/// Candidate Extension identities for a Cluster
pub fn cluster_to_extension_keys(cluster: &Cluster, extension_type: &str) -> Vec<ObjectKey> {
    vec![ObjectKey::new(cluster.name_any(), extension_type)]
}

/// Expands Cluster events into Extension keys that pass the predicate chain
pub struct ClusterToExtensionMapper<S> {
    store: Arc<S>,
    extension_type: String,
    predicates: PredicateChain,
}

impl<S: ExtensionStore> ClusterToExtensionMapper<S> {
    pub fn new(store: Arc<S>, extension_type: impl Into<String>, predicates: PredicateChain) -> Self {
        Self {
            store,
            extension_type: extension_type.into(),
            predicates,
        }
    }

    /// Keys to enqueue for a Cluster event; only updates map
    pub async fn map(&self, event: &WatchEvent<Cluster>) -> Vec<ObjectKey> {
        let WatchEvent::Updated { new: cluster, .. } = event else {
            return Vec::new();
        };

        let mut keys = Vec::new();
        for key in cluster_to_extension_keys(cluster, &self.extension_type) {
            let extension = match self.store.get_extension(&key).await {
                Ok(Some(extension)) => extension,
                Ok(None) => {
                    debug!("Cluster {} has no extension {}", cluster.name_any(), key);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read extension {} for cluster mapping: {}", key, e);
                    continue;
                }
            };
            // the extension itself did not change
            if self.predicates.accept(&WatchEvent::Generic(extension)).await {
                keys.push(key);
            }
        }
        keys
    }
}
