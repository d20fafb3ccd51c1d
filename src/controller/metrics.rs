//! Prometheus metrics for extension controllers
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `extension_reconcile_duration_seconds` (histogram): attempt duration labeled by controller.
//! - `extension_reconcile_errors_total` (counter): failed attempts labeled by controller and kind.
//! - `extension_retrying_keys` (gauge): keys waiting on a retry after a failed attempt, labeled by controller.

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "dns-extension-controller"
    pub controller: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, e.g. "kube", "conflict", "actuator"
    pub kind: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Gauge tracking keys with a scheduled retry in each controller
pub static RETRYING_KEYS: Lazy<Family<ReconcileLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "extension_reconcile_duration_seconds",
        "Duration of extension reconcile attempts in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "extension_reconcile_errors_total",
        "Total number of failed extension reconcile attempts",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "extension_retrying_keys",
        "Number of extension keys waiting on a retry after a failed reconcile",
        RETRYING_KEYS.clone(),
    );

    registry
});

pub fn observe_reconcile_duration(controller: &str, duration: Duration) {
    RECONCILE_DURATION_SECONDS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .observe(duration.as_secs_f64());
}

pub fn inc_reconcile_errors(controller: &str, kind: &str) {
    RECONCILE_ERRORS_TOTAL
        .get_or_create(&ErrorLabels {
            controller: controller.to_string(),
            kind: kind.to_string(),
        })
        .inc();
}

pub fn set_retrying_keys(controller: &str, keys: usize) {
    RETRYING_KEYS
        .get_or_create(&ReconcileLabels {
            controller: controller.to_string(),
        })
        .set(keys as i64);
}
