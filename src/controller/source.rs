//! Event sources feeding the controller
//!
//! `kube::runtime::watcher` reports the latest state of each object. Every
//! watch first feeds a reflector cache, which the store reads from. The
//! predicates need the previous state too, so [`EventTracker`] keeps the last
//! snapshot seen per key and turns watcher output into create/update/delete
//! events.

use std::collections::{HashMap, HashSet};

use futures::{stream, Stream, StreamExt};
use kube::{
    api::Api,
    runtime::{reflector::store::Writer, watcher, WatchStreamExt},
    Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::store::ObjectKey;

/// A change observed on a watched object
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Created(K),
    Updated { old: K, new: K },
    Deleted(K),
    /// Not caused by a change of the object itself (periodic resync or a
    /// change on a related object)
    Generic(K),
}

impl<K> WatchEvent<K> {
    /// The most recent snapshot carried by the event
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Created(obj) | WatchEvent::Deleted(obj) | WatchEvent::Generic(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Created(obj) | WatchEvent::Deleted(obj) | WatchEvent::Generic(obj) => obj,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

/// Converts watcher events into [`WatchEvent`]s using a last-seen cache
pub struct EventTracker<K> {
    known: HashMap<ObjectKey, K>,
    /// Keys seen during an in-progress relist
    relisted: Option<HashSet<ObjectKey>>,
}

impl<K> Default for EventTracker<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisted: None,
        }
    }
}

impl<K> EventTracker<K>
where
    K: Resource + Clone,
{
    pub fn track(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => {
                self.known.remove(&ObjectKey::from_resource(&obj));
                vec![WatchEvent::Deleted(obj)]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectKey::from_resource(&obj));
                }
                self.apply(obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                // Anything not seen during the relist was deleted while we were disconnected
                let Some(seen) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<ObjectKey> = self
                    .known
                    .keys()
                    .filter(|k| !seen.contains(*k))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|k| self.known.remove(&k))
                    .map(WatchEvent::Deleted)
                    .collect()
            }
        }
    }

    fn apply(&mut self, obj: K) -> Option<WatchEvent<K>> {
        let key = ObjectKey::from_resource(&obj);
        match self.known.insert(key, obj.clone()) {
            None => Some(WatchEvent::Created(obj)),
            // a relist replays unchanged objects
            Some(old) if old.resource_version().is_some()
                && old.resource_version() == obj.resource_version() =>
            {
                None
            }
            Some(old) => Some(WatchEvent::Updated { old, new: obj }),
        }
    }
}

/// Watch all objects served by `api`, keeping `cache` current and yielding
/// tracked events
///
/// Watch failures are logged and retried with the watcher's default backoff.
pub fn watch_events<K>(
    api: Api<K>,
    cache: Writer<K>,
    name: String,
) -> impl Stream<Item = WatchEvent<K>> + Send
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
{
    let mut tracker = EventTracker::default();
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(cache)
        .map(move |res| {
            let events = match res {
                Ok(event) => tracker.track(event),
                Err(e) => {
                    warn!("Watch error in controller {}: {}", name, e);
                    Vec::new()
                }
            };
            stream::iter(events)
        })
        .flatten()
}
