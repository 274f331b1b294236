//! Prometheus metrics.
//!
//! One registry per process, with typed handles grouped by subsystem.
//! The controller also keeps a plain atomic mirror of its refresh gauge
//! so shutdown and tests can poll quiescence without scraping.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{Error, Result};

const NAMESPACE: &str = "spines";

/// All metric families, plus the registry that serves `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub controller: ControllerMetrics,
    pub cache: CacheMetrics,
    pub http: HttpMetrics,
    pub store: StoreMetrics,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            controller: ControllerMetrics::new(&registry)?,
            cache: CacheMetrics::new(&registry)?,
            http: HttpMetrics::new(&registry)?,
            store: StoreMetrics::new(&registry)?,
            registry,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| Error::Configuration(format!("encoding metrics: {e}")))?;
        String::from_utf8(buf).map_err(|e| Error::Configuration(format!("metrics not utf8: {e}")))
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Counts of controller operations and pending background work.
pub struct ControllerMetrics {
    totals: IntCounterVec,
    pending: IntGaugeVec,
    refresh_waiting: AtomicI64,
}

impl ControllerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let totals = IntCounterVec::new(
            Opts::new("total_operations", "Counts of controller operations by type.")
                .namespace(NAMESPACE)
                .subsystem("controller"),
            &["type"],
        )
        .map_err(internal)?;
        let pending = IntGaugeVec::new(
            Opts::new(
                "pending_operations",
                "Counts of pending controller operations by type.",
            )
            .namespace(NAMESPACE)
            .subsystem("controller"),
            &["type"],
        )
        .map_err(internal)?;
        registry.register(Box::new(totals.clone())).map_err(internal)?;
        registry.register(Box::new(pending.clone())).map_err(internal)?;
        Ok(Self {
            totals,
            pending,
            refresh_waiting: AtomicI64::new(0),
        })
    }

    pub fn refresh_waiting_add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        self.refresh_waiting.fetch_add(delta, Ordering::SeqCst);
        self.pending.with_label_values(&["refresh"]).add(delta);
    }

    pub fn refresh_waiting(&self) -> i64 {
        self.refresh_waiting.load(Ordering::SeqCst)
    }

    pub fn denorm_waiting_set(&self, pending: i64) {
        self.pending
            .with_label_values(&["denormalization"])
            .set(pending);
    }

    pub fn etag_matches_inc(&self) {
        self.totals.with_label_values(&["etag_matches"]).inc();
    }

    pub fn etag_mismatches_inc(&self) {
        self.totals.with_label_values(&["etag_mismatches"]).inc();
    }

    pub fn etag_matches(&self) -> u64 {
        self.totals.with_label_values(&["etag_matches"]).get()
    }

    pub fn etag_mismatches(&self) -> u64 {
        self.totals.with_label_values(&["etag_mismatches"]).get()
    }

    /// Share of denormalizations skipped because nothing changed.
    pub fn etag_ratio(&self) -> f64 {
        let matches = self.etag_matches() as f64;
        let total = matches + self.etag_mismatches() as f64;
        if total == 0.0 {
            return 0.0;
        }
        matches / total
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Read-path cache outcomes.
pub struct CacheMetrics {
    totals: IntCounterVec,
}

impl CacheMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let totals = IntCounterVec::new(
            Opts::new("total", "Totals for the cache read path.")
                .namespace(NAMESPACE)
                .subsystem("cache"),
            &["type"],
        )
        .map_err(internal)?;
        registry.register(Box::new(totals.clone())).map_err(internal)?;
        Ok(Self { totals })
    }

    pub fn hit_inc(&self) {
        self.totals.with_label_values(&["hits"]).inc();
    }

    pub fn miss_inc(&self) {
        self.totals.with_label_values(&["misses"]).inc();
    }

    pub fn hits(&self) -> u64 {
        self.totals.with_label_values(&["hits"]).get()
    }

    pub fn misses(&self) -> u64 {
        self.totals.with_label_values(&["misses"]).get()
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Inbound request latencies and concurrency.
pub struct HttpMetrics {
    pub requests: HistogramVec,
    pub inflight: IntGauge,
}

impl HttpMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let requests = HistogramVec::new(
            HistogramOpts::new("requests", "HTTP request latencies by method & path.")
                .namespace(NAMESPACE)
                .subsystem("http")
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 1.5, 2.0, 2.5, 5.0, 7.5, 10.0,
                    30.0, 60.0, 120.0,
                ]),
            &["method", "path", "status"],
        )
        .map_err(internal)?;
        let inflight = IntGauge::with_opts(
            Opts::new(
                "inflight",
                "Current number of inbound in-flight HTTP requests.",
            )
            .namespace(NAMESPACE)
            .subsystem("http"),
        )
        .map_err(internal)?;
        registry
            .register(Box::new(requests.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(inflight.clone()))
            .map_err(internal)?;
        Ok(Self { requests, inflight })
    }
}

// ============================================================================
// Store counts
// ============================================================================

/// Per-prefix entry counts in the KV store. Collection is expensive for
/// a real store, so the collector only runs when the dirty bit is set.
pub struct StoreMetrics {
    gauge: IntGaugeVec,
    dirty: AtomicBool,
}

impl StoreMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let gauge = IntGaugeVec::new(
            Opts::new("total", "Counts of persisted objects by type.")
                .namespace(NAMESPACE)
                .subsystem("store"),
            &["type"],
        )
        .map_err(internal)?;
        registry.register(Box::new(gauge.clone())).map_err(internal)?;
        Ok(Self {
            gauge,
            // Start dirty to trigger an initial collection.
            dirty: AtomicBool::new(true),
        })
    }

    pub fn set_count(&self, kind: &str, count: i64) {
        self.gauge.with_label_values(&[kind]).set(count);
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Returns whether a collection is due, clearing the bit.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }
}

fn internal(err: prometheus::Error) -> Error {
    Error::Configuration(format!("registering metrics: {err}"))
}
