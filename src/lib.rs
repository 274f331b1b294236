//! Spines is a read-through metadata proxy for book-library clients.
//!
//! Clients request authors, works (abstract titles), and editions
//! (concrete printings) by numeric ID and expect richly nested JSON.
//! Upstream providers only expose these entities behind expensive,
//! paginated, rate-limited endpoints, so everything here is built around
//! a cache that is populated eagerly and reconciled asynchronously:
//!
//! - The [`controller::Controller`] owns the read path. Lookups are
//!   coalesced per key, served from cache when possible, and written
//!   back with jittered TTLs. Request-path work is O(1); anything more
//!   expensive is deferred.
//! - The denormalizer drains an [`edges::EdgeBuffer`] in the background,
//!   folding freshly fetched children into their parent documents so a
//!   later read of the parent reflects the child. An ETag comparison
//!   short-circuits writes (and upward propagation) when nothing
//!   changed.
//! - Background author refreshes walk the upstream's edition listing to
//!   grow large authors beyond their initial seed, bounded by a
//!   concurrency pool and resumable across restarts via the persister.
//!
//! Upstream adapters implement [`getter::Getter`]; the storage layer
//! implements [`cache::Cache`]. Both are injected, so the core never
//! talks to the network or a database directly.

pub mod cache;
pub mod controller;
pub mod edges;
pub mod error;
pub mod etag;
pub mod getter;
pub mod metrics;
pub mod persist;
pub mod services;
pub mod singleflight;
pub mod types;

pub use controller::Controller;
pub use error::{Error, Result};
