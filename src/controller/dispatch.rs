//! Watch/dispatch wiring for one extension controller
//!
//! Extension events (and, in level-triggered mode, Cluster events) are
//! filtered by the predicate chain before they reach a
//! `kube::runtime::Controller`. The runtime deduplicates keys, runs at most
//! one reconcile per key and redelivers a key once if it changed while in
//! flight. Failures are rescheduled by the error policy using per-key
//! failure counts held here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{channel::oneshot, stream, FutureExt, Stream, StreamExt};
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::{self, Store},
        watcher,
    },
    Client,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Cluster, Extension, ExtensionClass};
use crate::error::{Error, Result};

use super::actuator::Actuator;
use super::backoff::BackoffConfig;
use super::finalizers::{finalizer_name, FINALIZER_PREFIX};
use super::mapper::{cluster_to_extension_keys, ClusterToExtensionMapper};
use super::predicates::{controller_predicates, matches_type_and_class, Predicate, PredicateChain};
use super::reconciler::Reconciler;
use super::source::{watch_events, WatchEvent};
use super::store::{ExtensionStore, KubeStore, ObjectKey};

/// Default interval between full resyncs
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(60);

/// Default number of concurrent workers per controller
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: usize = 5;

/// Default deadline for a single reconcile attempt
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(180);

/// Registration parameters for one extension controller
pub struct ControllerArgs<A> {
    /// Used for logging, tracing spans and metrics labels
    pub name: String,
    pub actuator: A,
    /// The controller's finalizer is `extensions.gardener.cloud/<finalizer_suffix>`
    pub finalizer_suffix: String,
    pub resync: Duration,
    pub extension_type: String,
    /// `None` accepts every class
    pub extension_class: Option<ExtensionClass>,
    /// Reconcile on every spec change instead of waiting for the operation annotation
    pub ignore_operation_annotation: bool,
    /// Appended to the default predicate chain
    pub predicates: Vec<Arc<dyn Predicate>>,
    pub max_concurrent_reconciles: usize,
    pub reconcile_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl<A: Actuator> ControllerArgs<A> {
    /// Arguments with defaults for everything but the type and the actuator
    pub fn new(extension_type: impl Into<String>, actuator: A) -> Self {
        let extension_type = extension_type.into();
        Self {
            name: format!("{extension_type}-extension-controller"),
            actuator,
            finalizer_suffix: extension_type.clone(),
            resync: DEFAULT_RESYNC,
            extension_type,
            extension_class: Some(ExtensionClass::Shoot),
            ignore_operation_annotation: false,
            predicates: Vec::new(),
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::ConfigError("controller name must not be empty".into()));
        }
        if self.extension_type.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "controller {}: extension type must not be empty",
                self.name
            )));
        }
        if self.finalizer_suffix.trim().is_empty() || self.finalizer_suffix.contains('/') {
            return Err(Error::ConfigError(format!(
                "controller {}: invalid finalizer suffix {:?}",
                self.name, self.finalizer_suffix
            )));
        }
        if self.max_concurrent_reconciles == 0
            || self.max_concurrent_reconciles > usize::from(u16::MAX)
        {
            return Err(Error::ConfigError(format!(
                "controller {}: max_concurrent_reconciles must be within 1..={}",
                self.name,
                u16::MAX
            )));
        }
        if self.resync.is_zero() || self.reconcile_timeout.is_zero() {
            return Err(Error::ConfigError(format!(
                "controller {}: resync and reconcile timeout must be positive",
                self.name
            )));
        }
        if self.backoff.base.is_zero() || self.backoff.max < self.backoff.base {
            return Err(Error::ConfigError(format!(
                "controller {}: backoff max must be at least the non-zero base",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(Error::ConfigError(format!(
                "controller {}: backoff jitter must be within 0.0..=1.0",
                self.name
            )));
        }
        Ok(())
    }
}

/// A configured extension controller: predicate chain, reconciler and retry state
pub struct ExtensionController<A, S> {
    name: String,
    extension_type: String,
    extension_class: Option<ExtensionClass>,
    ignore_operation_annotation: bool,
    resync: Duration,
    max_concurrent_reconciles: usize,
    reconcile_timeout: Duration,
    backoff: BackoffConfig,
    /// Consecutive failed attempts per key; cleared on success or terminal failure
    failures: Mutex<HashMap<ObjectKey, u32>>,
    predicates: PredicateChain,
    mapper: ClusterToExtensionMapper<S>,
    reconciler: Reconciler<A, S>,
    store: Arc<S>,
}

impl<A: Actuator, S: ExtensionStore> ExtensionController<A, S> {
    pub fn new(args: ControllerArgs<A>, store: Arc<S>) -> Result<Self> {
        args.validate()?;

        let predicates = controller_predicates(
            &args.extension_type,
            args.extension_class,
            args.ignore_operation_annotation,
            Arc::clone(&store),
            args.predicates,
        );
        let mapper = ClusterToExtensionMapper::new(
            Arc::clone(&store),
            args.extension_type.clone(),
            predicates.clone(),
        );
        let reconciler = Reconciler::new(
            args.name.clone(),
            args.actuator,
            Arc::clone(&store),
            finalizer_name(FINALIZER_PREFIX, &args.finalizer_suffix),
            args.ignore_operation_annotation,
        );

        Ok(Self {
            name: args.name,
            extension_type: args.extension_type,
            extension_class: args.extension_class,
            ignore_operation_annotation: args.ignore_operation_annotation,
            resync: args.resync,
            max_concurrent_reconciles: args.max_concurrent_reconciles,
            reconcile_timeout: args.reconcile_timeout,
            backoff: args.backoff,
            failures: Mutex::new(HashMap::new()),
            predicates,
            mapper,
            reconciler,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finalizer(&self) -> &str {
        self.reconciler.finalizer()
    }

    /// Cluster changes only trigger reconciles in level-triggered mode
    pub fn watches_clusters(&self) -> bool {
        self.ignore_operation_annotation
    }

    /// Whether an Extension event should trigger a reconcile
    pub async fn should_reconcile(&self, event: &WatchEvent<Extension>) -> bool {
        // removed from the API, so no finalizer of ours is left on it
        if matches!(event, WatchEvent::Deleted(_)) {
            return false;
        }
        self.predicates.accept(event).await
    }

    /// Extension keys triggered by a Cluster event; none in annotation-gated mode
    pub async fn cluster_triggers(&self, event: &WatchEvent<Cluster>) -> Vec<ObjectKey> {
        if !self.watches_clusters() {
            return Vec::new();
        }
        self.mapper.map(event).await
    }

    /// Extensions of the configured type and class to reconcile on a resync
    ///
    /// Extensions whose last attempt failed terminally are skipped; only a
    /// watch event for an external change retries them.
    pub async fn resync_keys(&self) -> Result<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        for extension in self.store.list_extensions().await? {
            if !matches_type_and_class(&extension, &self.extension_type, self.extension_class) {
                continue;
            }
            if extension.has_terminal_failure() {
                debug!(
                    "Skipping resync of {}: last attempt failed terminally",
                    ObjectKey::from_resource(&extension)
                );
                continue;
            }
            let key = ObjectKey::from_resource(&extension);
            if self.predicates.accept(&WatchEvent::Generic(extension)).await {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Run one reconcile attempt for `key`, bounded by the reconcile timeout
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(
            self.reconcile_timeout,
            self.reconciler.reconcile(key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                key: key.to_string(),
                timeout: self.reconcile_timeout,
            }),
        };

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration(&self.name, started.elapsed());
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        if result.is_ok() {
            self.forget(key);
        }
        result
    }

    /// Decide when a failed attempt is retried
    pub fn error_policy(&self, key: &ObjectKey, err: &Error) -> Action {
        #[cfg(feature = "metrics")]
        super::metrics::inc_reconcile_errors(&self.name, err.kind());

        if err.is_conflict() {
            debug!("Conflict reconciling {}, retrying immediately", key);
            return Action::requeue(Duration::ZERO);
        }
        if !err.is_retriable() {
            error!("Reconcile of {} failed permanently: {}", key, err);
            self.forget(key);
            return Action::await_change();
        }

        let failures = self.record_failure(key);
        let delay = err
            .requeue_after()
            .unwrap_or_else(|| self.backoff.delay(failures - 1));
        warn!(
            "Reconcile of {} failed ({} in a row): {}, retrying in {:?}",
            key, failures, err, delay
        );
        Action::requeue(delay)
    }

    /// Consecutive failed attempts recorded for a key
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock_failures().get(key).copied().unwrap_or(0)
    }

    fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut failures = self.lock_failures();
        let count = failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;
        self.record_retrying_keys(failures.len());
        count
    }

    fn forget(&self, key: &ObjectKey) {
        let mut failures = self.lock_failures();
        if failures.remove(key).is_some() {
            self.record_retrying_keys(failures.len());
        }
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashMap<ObjectKey, u32>> {
        // A poisoned lock only means an attempt panicked mid-update; the counts stay usable
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_retrying_keys(&self, keys: usize) {
        #[cfg(feature = "metrics")]
        super::metrics::set_retrying_keys(&self.name, keys);
        #[cfg(not(feature = "metrics"))]
        let _ = keys;
    }

    /// Drive the controller until `shutdown` flips to true or its sender is dropped
    ///
    /// `cache` must be the reflector fed by `extension_events`. The Cluster
    /// stream is polled in both modes so that its cache stays current. On
    /// shutdown no new attempts start and in-flight ones are awaited; each is
    /// bounded by the reconcile timeout.
    #[instrument(skip_all, fields(controller = %self.name))]
    pub async fn run<E, C>(
        self: Arc<Self>,
        extension_events: E,
        cluster_events: C,
        cache: Store<Extension>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        E: Stream<Item = WatchEvent<Extension>> + Send + 'static,
        C: Stream<Item = WatchEvent<Cluster>> + Send + 'static,
    {
        info!(
            "Starting controller {} for type {} with {} workers",
            self.name, self.extension_type, self.max_concurrent_reconciles
        );

        let ctx = Arc::clone(&self);
        let extension_triggers = extension_events.filter_map(move |event| {
            let ctx = Arc::clone(&ctx);
            async move {
                let accepted = ctx.should_reconcile(&event).await;
                accepted.then(|| Ok::<_, watcher::Error>(event.into_object()))
            }
        });

        // A Cluster maps to a single candidate key; it passes only when that key was admitted
        let ctx = Arc::clone(&self);
        let cluster_triggers = cluster_events.filter_map(move |event| {
            let ctx = Arc::clone(&ctx);
            async move {
                let admitted = !ctx.cluster_triggers(&event).await.is_empty();
                admitted.then(|| Ok::<_, watcher::Error>(event.into_object()))
            }
        });
        let extension_type = self.extension_type.clone();
        let cluster_to_extensions = move |cluster: Cluster| {
            cluster_to_extension_keys(&cluster, &extension_type)
                .into_iter()
                .map(|key| key.object_ref::<Extension>())
                .collect::<Vec<_>>()
        };

        let resync = stream::unfold(Arc::clone(&self), |ctx| async move {
            tokio::time::sleep(ctx.resync).await;
            let keys = match ctx.resync_keys().await {
                Ok(keys) => {
                    debug!("Controller {} resync enqueued {} extensions", ctx.name, keys.len());
                    keys
                }
                Err(e) => {
                    warn!("Controller {} resync failed: {}", ctx.name, e);
                    Vec::new()
                }
            };
            Some((stream::iter(keys), ctx))
        })
        .flatten()
        .map(|key| key.object_ref::<Extension>());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let stop_relay = tokio::spawn(async move {
            // a dropped sender also stops the controller
            let _ = shutdown.wait_for(|stop| *stop).await;
            let _ = stop_tx.send(());
        });

        let concurrency = u16::try_from(self.max_concurrent_reconciles).unwrap_or(u16::MAX);
        Controller::for_stream(extension_triggers, cache)
            .with_config(controller::Config::default().concurrency(concurrency))
            .watches_stream(cluster_triggers, cluster_to_extensions)
            .reconcile_on(resync)
            .graceful_shutdown_on(stop_rx.map(|_| ()))
            .run(
                reconcile_extension::<A, S>,
                error_policy::<A, S>,
                Arc::clone(&self),
            )
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {}", obj),
                    Err(e) => debug!("Reconcile attempt ended with error: {}", e),
                }
            })
            .await;

        stop_relay.abort();
        info!("Controller {} stopped", self.name);
    }
}

async fn reconcile_extension<A: Actuator, S: ExtensionStore>(
    extension: Arc<Extension>,
    ctx: Arc<ExtensionController<A, S>>,
) -> Result<Action> {
    ctx.reconcile(&ObjectKey::from_resource(extension.as_ref()))
        .await
}

fn error_policy<A: Actuator, S: ExtensionStore>(
    extension: Arc<Extension>,
    error: &Error,
    ctx: Arc<ExtensionController<A, S>>,
) -> Action {
    ctx.error_policy(&ObjectKey::from_resource(extension.as_ref()), error)
}

/// Fail fast when the Extension or Cluster CRD is not served
async fn verify_crds(client: &Client) -> Result<()> {
    let lp = ListParams::default().limit(1);
    Api::<Extension>::all(client.clone())
        .list(&lp)
        .await
        .map_err(|e| Error::ConfigError(format!("Extension CRD is not available: {e}")))?;
    Api::<Cluster>::all(client.clone())
        .list(&lp)
        .await
        .map_err(|e| Error::ConfigError(format!("Cluster CRD is not available: {e}")))?;
    Ok(())
}

/// Register a controller against the API server and run it until shutdown
///
/// Returns an error without starting anything if the arguments are invalid
/// or the CRDs are not installed.
pub async fn run_controller<A: Actuator>(
    client: Client,
    args: ControllerArgs<A>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    verify_crds(&client).await?;

    let (extension_cache, extension_writer) = reflector::store();
    let (cluster_cache, cluster_writer) = reflector::store();
    let store = Arc::new(KubeStore::new(
        client.clone(),
        args.name.clone(),
        extension_cache.clone(),
        cluster_cache,
    ));
    let controller = Arc::new(ExtensionController::new(args, store)?);
    let name = controller.name().to_string();

    let extension_events = watch_events(
        Api::<Extension>::all(client.clone()),
        extension_writer,
        name.clone(),
    );
    // Watched in both modes: the cluster-health gate reads from this cache
    let cluster_events = watch_events(Api::<Cluster>::all(client), cluster_writer, name);

    controller
        .run(extension_events, cluster_events, extension_cache, shutdown)
        .await;
    Ok(())
}
