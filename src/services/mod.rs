//! Background Services Module
//!
//! Long-running tasks that keep the cache healthy without touching the
//! request path:
//!
//! - **DenormService**: drains the denormalization edge queue
//! - **StatsService**: logs controller gauges once a minute
//! - **CountCollector**: polls per-prefix store counts behind a dirty bit
//!
//! A [`ServiceManager`] owns the shutdown broadcast and joins every
//! service on the way out. Services drain before stopping where that
//! matters (the denormalizer waits for queue quiescence).

pub mod denormalizer;
pub mod stats;

pub use denormalizer::DenormService;
pub use stats::{CountCollector, StatsService};

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;

/// Lifecycle state of a background service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Running,
    Failed(String),
}

/// A long-running background task with cooperative shutdown.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Run until a shutdown signal arrives, then return after any
    /// required draining.
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;

    fn name(&self) -> &'static str;

    fn status(&self) -> ServiceStatus;
}

/// Coordinates the lifecycle of all registered services.
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            services: Vec::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Spawn every registered service with its own shutdown receiver.
    pub fn start_all(&self) {
        let mut handles = self.handles.lock();
        for service in &self.services {
            let rx = self.shutdown_tx.subscribe();
            let service = Arc::clone(service);
            let name = service.name();
            info!(service = name, "starting service");
            handles.push((
                name,
                tokio::spawn(async move {
                    if let Err(err) = service.start(rx).await {
                        error!(service = service.name(), %err, "service failed");
                    }
                }),
            ));
        }
    }

    /// Broadcast shutdown and wait for every service to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (name, handle) in handles {
            if handle.await.is_err() {
                error!(service = name, "service task panicked");
            } else {
                info!(service = name, "service stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::time::Duration;

    struct TickService {
        status: RwLock<ServiceStatus>,
    }

    #[async_trait]
    impl Service for TickService {
        async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
            *self.status.write() = ServiceStatus::Running;
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {}
                }
            }
            *self.status.write() = ServiceStatus::Stopped;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "tick"
        }

        fn status(&self) -> ServiceStatus {
            self.status.read().clone()
        }
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let service = Arc::new(TickService {
            status: RwLock::new(ServiceStatus::Stopped),
        });

        let mut manager = ServiceManager::new();
        manager.register(service.clone());
        manager.start_all();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        tokio::time::timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .expect("shutdown should complete");
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }
}
