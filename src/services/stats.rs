//! Periodic observability tasks: the once-a-minute controller stats log
//! and the store count collector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::debug;

use super::{Service, ServiceStatus};
use crate::cache::Cache;
use crate::controller::Controller;
use crate::error::Result;
use crate::metrics::Metrics;

// ============================================================================
// Stats logger
// ============================================================================

/// Logs controller gauges at a low frequency so operators can follow
/// background progress from the logs alone.
pub struct StatsService {
    ctrl: Controller,
    period: Duration,
    status: RwLock<ServiceStatus>,
}

impl StatsService {
    pub fn new(ctrl: Controller) -> Self {
        Self::with_period(ctrl, Duration::from_secs(60))
    }

    pub fn with_period(ctrl: Controller, period: Duration) -> Self {
        Self {
            ctrl,
            period,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    fn log_stats(&self) {
        let metrics = self.ctrl.metrics();
        debug!(
            refresh_waiting = self.ctrl.refresh_waiting(),
            denorm_waiting = self.ctrl.pending_denorm(),
            etag_matches = metrics.controller.etag_matches(),
            etag_ratio = metrics.controller.etag_ratio(),
            cache_hits = metrics.cache.hits(),
            cache_misses = metrics.cache.misses(),
            "controller stats"
        );
    }
}

#[async_trait]
impl Service for StatsService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        *self.status.write() = ServiceStatus::Running;
        let mut tick = interval(self.period);
        tick.tick().await; // The first tick fires immediately; skip it.

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => self.log_stats(),
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stats"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

// ============================================================================
// Store count collector
// ============================================================================

const COUNT_PREFIXES: &[(&str, &str)] = &[
    ("a", "authors"),
    ("w", "works"),
    ("b", "editions"),
    ("s", "series"),
    ("z", "asins"),
    ("ra", "refreshing"),
];

/// Collects per-prefix entry counts from the store every five minutes.
/// Counting is expensive on a real store, so a cycle only runs when a
/// write has set the dirty bit since the last collection.
pub struct CountCollector {
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
    period: Duration,
    status: RwLock<ServiceStatus>,
}

impl CountCollector {
    pub fn new(cache: Arc<dyn Cache>, metrics: Arc<Metrics>) -> Self {
        Self::with_period(cache, metrics, Duration::from_secs(5 * 60))
    }

    pub fn with_period(cache: Arc<dyn Cache>, metrics: Arc<Metrics>, period: Duration) -> Self {
        Self {
            cache,
            metrics,
            period,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }

    async fn collect(&self) {
        if !self.metrics.store.take_dirty() {
            return;
        }
        for (prefix, kind) in COUNT_PREFIXES {
            let count = self.cache.keys_with_prefix(prefix).await.len();
            // The author prefix also matches nothing else; `ra` keys
            // start with `r`, so prefixes stay disjoint.
            self.metrics.store.set_count(kind, count as i64);
        }
    }
}

#[async_trait]
impl Service for CountCollector {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        *self.status.write() = ServiceStatus::Running;
        let mut tick = interval(self.period);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => self.collect().await,
            }
        }

        *self.status.write() = ServiceStatus::Stopped;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "count_collector"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}
