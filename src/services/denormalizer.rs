//! Denormalization drain service.
//!
//! Hosts the controller's edge-drain loop as a managed service. On
//! shutdown the queue is drained to quiescence before the loop is
//! closed, so no accepted edge is lost.

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Service, ServiceStatus};
use crate::controller::Controller;
use crate::error::Result;

pub struct DenormService {
    ctrl: Controller,
    status: RwLock<ServiceStatus>,
}

impl DenormService {
    pub fn new(ctrl: Controller) -> Self {
        Self {
            ctrl,
            status: RwLock::new(ServiceStatus::Stopped),
        }
    }
}

#[async_trait]
impl Service for DenormService {
    async fn start(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        *self.status.write() = ServiceStatus::Running;
        debug!("denormalizer started");

        let drain = {
            let ctrl = self.ctrl.clone();
            tokio::spawn(async move { ctrl.run().await })
        };

        // Any recv outcome means we're shutting down.
        let _ = shutdown.recv().await;

        debug!(
            pending = self.ctrl.pending_denorm(),
            "denormalizer draining"
        );
        self.ctrl.shutdown().await;
        let _ = drain.await;

        *self.status.write() = ServiceStatus::Stopped;
        debug!("denormalizer stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "denormalizer"
    }

    fn status(&self) -> ServiceStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::controller::testsupport::{controller_with, ScriptedGetter};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drains_and_stops_on_shutdown() {
        let cache = Arc::new(MemoryCache::new());
        let getter = Arc::new(ScriptedGetter::with_cache(cache.clone()));
        let ctrl = controller_with(cache, getter);

        let service = Arc::new(DenormService::new(ctrl));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let service = service.clone();
            tokio::spawn(async move { service.start(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(service.status(), ServiceStatus::Running);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("service should stop")
            .unwrap()
            .unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
    }
}
