//! Cache contract, key layout, and TTL policy.
//!
//! The store is a flat string → bytes table with per-entry TTLs. Values
//! are opaque to the store (JSON documents in this deployment) plus one
//! reserved sentinel byte for negative caching. A single table holds
//! every entity kind, distinguished by a short key prefix:
//!
//! | prefix | entity |
//! |--------|--------|
//! | `a`    | author |
//! | `w`    | work |
//! | `b`    | book (edition) |
//! | `s`    | series |
//! | `z`    | ASIN → edition mapping |
//! | `ra`   | pre-refresh author snapshot |
//!
//! Expired entries are not eagerly dropped: `get_with_ttl` reports them
//! with a zero TTL so the controller can keep serving the last-known
//! document while a refresh settles.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;

/// Sentinel byte sequence cached in place of a 404 response.
pub const MISSING: &[u8] = &[0];

/// True if the cached bytes are the negative-cache sentinel.
pub fn is_missing(bytes: &[u8]) -> bool {
    bytes == MISSING
}

// ============================================================================
// TTL policy
// ============================================================================

/// Base TTL for author documents.
pub const AUTHOR_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Base TTL for work documents.
pub const WORK_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// Base TTL for edition documents.
pub const EDITION_TTL: Duration = Duration::from_secs(28 * 24 * 60 * 60);
/// TTL for series documents. Not fuzzed.
pub const SERIES_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// How long a 404 is negatively cached before we retry upstream.
pub const MISSING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// TTL for ASIN → edition mappings.
pub const ASIN_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// TTL for pre-refresh author snapshots.
pub const REFRESH_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Scale a TTL by a factor drawn uniformly from `[1, f]` so entries
/// written together don't expire together.
pub fn fuzz(d: Duration, f: f64) -> Duration {
    let f = if f < 1.0 { f + 1.0 } else { f };
    let factor = 1.0 + rand::random::<f64>() * (f - 1.0);
    d.mul_f64(factor)
}

// ============================================================================
// Key layout
// ============================================================================

pub fn author_key(author_id: i64) -> String {
    format!("a{author_id}")
}

pub fn work_key(work_id: i64) -> String {
    format!("w{work_id}")
}

pub fn book_key(book_id: i64) -> String {
    format!("b{book_id}")
}

pub fn series_key(series_id: i64) -> String {
    format!("s{series_id}")
}

pub fn asin_key(asin: &str) -> String {
    format!("z{asin}")
}

/// Key holding an author's pre-refresh snapshot while a background full
/// load runs. Presence doubles as the refresh-in-progress marker.
pub fn refresh_author_key(author_id: i64) -> String {
    format!("ra{author_id}")
}

// ============================================================================
// Contract
// ============================================================================

/// The key-value store the controller reads through.
///
/// Implementations must tolerate concurrent access. The production store
/// persists across restarts; [`MemoryCache`] backs tests and standalone
/// deployments.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// Fetch a value regardless of its remaining TTL.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Fetch a value along with its remaining TTL. Expired entries are
    /// returned with a zero TTL rather than dropped, so callers can
    /// treat the bytes as a stale last-known state.
    async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)>;

    /// Store a value with the given TTL, replacing any existing entry.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration);

    /// Force an entry to expire immediately without removing its bytes.
    async fn expire(&self, key: &str) -> Result<()>;

    /// Remove an entry entirely.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys with the given prefix, in insertion order. Used for
    /// refresh recovery and size metrics.
    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct Entry {
    value: Bytes,
    expires_at: Instant,
    seq: u64,
}

/// Thread-safe in-memory cache.
///
/// Entries survive expiry (with zero TTL) until deleted or overwritten,
/// matching the behavior the controller depends on for stale reads.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    seq: RwLock<u64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        let mut seq = self.seq.write();
        *seq += 1;
        *seq
    }

    /// Number of live entries, including expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.read().get(key).map(|e| e.value.clone())
    }

    async fn get_with_ttl(&self, key: &str) -> Option<(Bytes, Duration)> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        let ttl = entry.expires_at.saturating_duration_since(Instant::now());
        Some((entry.value.clone(), ttl))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let seq = self.next_seq();
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                seq,
            },
        );
    }

    async fn expire(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.expires_at = Instant::now();
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let entries = self.entries.read();
        let mut keys: Vec<(&String, u64)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k, e.seq))
            .collect();
        keys.sort_by_key(|(_, seq)| *seq);
        keys.into_iter().map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_key_layout() {
        assert_eq!(author_key(51942), "a51942");
        assert_eq!(work_key(6803732), "w6803732");
        assert_eq!(book_key(6609765), "b6609765");
        assert_eq!(series_key(7), "s7");
        assert_eq!(asin_key("B00ABC1234"), "zB00ABC1234");
        assert_eq!(refresh_author_key(4178), "ra4178");
    }

    #[test]
    fn test_fuzz_bounds() {
        for _ in 0..100 {
            let fuzzed = fuzz(AUTHOR_TTL, 1.5);
            assert!(fuzzed >= AUTHOR_TTL);
            assert!(fuzzed <= AUTHOR_TTL.mul_f64(1.5));
        }
        // A factor below one is treated as 1 + f.
        let fuzzed = fuzz(DAY, 0.5);
        assert!(fuzzed >= DAY);
        assert!(fuzzed <= DAY.mul_f64(1.5));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("a1", Bytes::from_static(b"author"), DAY).await;

        assert_eq!(cache.get("a1").await.unwrap(), Bytes::from_static(b"author"));
        let (bytes, ttl) = cache.get_with_ttl("a1").await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"author"));
        assert!(ttl > Duration::ZERO);

        cache.delete("a1").await.unwrap();
        assert!(cache.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_remain_readable() {
        let cache = MemoryCache::new();
        cache.set("w1", Bytes::from_static(b"work"), DAY).await;
        cache.expire("w1").await.unwrap();

        // The bytes survive with zero TTL.
        let (bytes, ttl) = cache.get_with_ttl("w1").await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"work"));
        assert_eq!(ttl, Duration::ZERO);
        assert!(cache.get("w1").await.is_some());
    }

    #[tokio::test]
    async fn test_prefix_scan_insertion_order() {
        let cache = MemoryCache::new();
        cache.set("ra3", Bytes::from_static(b"c"), DAY).await;
        cache.set("a1", Bytes::from_static(b"x"), DAY).await;
        cache.set("ra1", Bytes::from_static(b"a"), DAY).await;
        cache.set("ra2", Bytes::from_static(b"b"), DAY).await;

        let keys = cache.keys_with_prefix("ra").await;
        assert_eq!(keys, vec!["ra3", "ra1", "ra2"]);

        // Author keys don't leak into the refresh prefix or vice versa.
        assert_eq!(cache.keys_with_prefix("a").await, vec!["a1"]);
    }

    #[test]
    fn test_missing_sentinel() {
        assert!(is_missing(MISSING));
        assert!(!is_missing(b"{}"));
        assert!(!is_missing(&[0, 0]));
    }
}
