//! Refresh persistence.
//!
//! A background author refresh can take minutes for a large author. If
//! the process restarts mid-refresh, the `ra` snapshot would otherwise
//! shadow the main entry forever (readers prefer it, and only the
//! refresh-done path deletes it). The persister records which refreshes
//! are in flight so startup can resume each one exactly once. This is
//! the only durable state the controller relies on beyond the cached
//! documents themselves.

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::{refresh_author_key, Cache, REFRESH_TTL};
use crate::error::Result;
use std::sync::Arc;

/// Records in-flight author refreshes across restarts.
#[async_trait]
pub trait Persister: Send + Sync + 'static {
    /// Record an author's refresh as in-flight, storing the pre-refresh
    /// snapshot readers should see meanwhile.
    async fn persist(&self, author_id: i64, snapshot: Bytes) -> Result<()>;

    /// All in-flight author refreshes, oldest first.
    async fn persisted(&self) -> Result<Vec<i64>>;

    /// Record an in-flight refresh as completed.
    async fn delete(&self, author_id: i64) -> Result<()>;
}

/// No-op persistence for tests and ephemeral deployments.
pub struct NoPersister;

#[async_trait]
impl Persister for NoPersister {
    async fn persist(&self, _author_id: i64, _snapshot: Bytes) -> Result<()> {
        Ok(())
    }

    async fn persisted(&self) -> Result<Vec<i64>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _author_id: i64) -> Result<()> {
        Ok(())
    }
}

/// Persister backed by the same KV store as the cache, keyed `ra<id>`.
pub struct CachePersister {
    cache: Arc<dyn Cache>,
}

impl CachePersister {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Persister for CachePersister {
    async fn persist(&self, author_id: i64, snapshot: Bytes) -> Result<()> {
        self.cache
            .set(&refresh_author_key(author_id), snapshot, REFRESH_TTL)
            .await;
        Ok(())
    }

    async fn persisted(&self) -> Result<Vec<i64>> {
        let keys = self.cache.keys_with_prefix("ra").await;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix("ra")?.parse::<i64>().ok())
            .collect())
    }

    async fn delete(&self, author_id: i64) -> Result<()> {
        self.cache.delete(&refresh_author_key(author_id)).await
    }
}
