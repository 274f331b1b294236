//! The controller: a coalescing read-through cache with asynchronous
//! denormalization of parent/child relationships.
//!
//! Every public lookup runs inside a singleflight group so concurrent
//! requests for the same entity share one upstream fetch. The request
//! path only ever performs O(1) work: cache lookups, one Getter call on
//! a miss, and a cache write. Anything more expensive — folding editions
//! into works, works into authors, walking an author's full backlist —
//! is deferred to background tasks. The legacy metadata server does this
//! work in the request path, which is exactly why large authors don't
//! work there: O(works × editions) doesn't fit in the lifespan of a
//! request.
//!
//! Data is cached eagerly, when it is requested. There is no bulk dump
//! to import, so new works are available as soon as the upstream has
//! them.

mod denorm;

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::{
    asin_key, author_key, book_key, fuzz, is_missing, refresh_author_key, series_key, work_key,
    Cache, ASIN_TTL, AUTHOR_TTL, EDITION_TTL, MISSING, MISSING_TTL, SERIES_TTL, WORK_TTL,
};
use crate::edges::{Edge, EdgeBuffer, EdgeKind};
use crate::error::{Error, Result};
use crate::getter::{EditionsCallback, Getter};
use crate::metrics::Metrics;
use crate::persist::Persister;
use crate::singleflight::Group;
use crate::types::{
    AsinResource, RecommendationsResource, SearchResource, SearchResourceAuthor, WorkResource,
};

/// Bytes of a cached document plus the TTL the handler should advertise.
pub type DocumentTtl = (Bytes, Duration);

/// How many author refreshes may run concurrently. Excess tasks queue on
/// the semaphore.
const REFRESH_CONCURRENCY: usize = 15;

/// An author refresh stops walking the upstream listing after this many
/// editions. Some aggregator authors have six-figure inventories.
const MAX_REFRESH_EDITIONS: usize = 1_000;

/// Budget for a single denormalization step.
const EDGE_DEADLINE: Duration = Duration::from_secs(60);

/// TTL hint returned while an author's background refresh is running, so
/// clients re-poll soon after it settles.
const REFRESHING_TTL_HINT: Duration = Duration::from_secs(60 * 60);

/// Aggregator/placeholder author IDs which always 404 upstream or carry
/// pathologically large inventories. The usable "unknown" author is
/// 4699102. Short-circuited without an upstream call.
pub(crate) fn unknown_author(author_id: i64) -> bool {
    author_id == 22294257
        || author_id == 5158478
        || author_id == 5481957
        || author_id == 4699102
        || author_id == 14144674 // SuperSummary, 10k works
        || author_id == 5153555 // Wikipedia, 120k
        || author_id == 4340042 // Books LLC, 31k
}

/// Facilitates operations on the cache by scheduling background work and
/// handling invalidation. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<dyn Cache>,
    getter: Arc<dyn Getter>,
    persister: Arc<dyn Persister>,

    /// Coalesces document lookups by cache key.
    docs: Group<DocumentTtl>,
    series: Group<Bytes>,
    asins: Group<i64>,

    /// Serializes denormalization updates. Only push resources that have
    /// already been fetched.
    edges: EdgeBuffer,

    /// Bounds how many authors/works we sync in the background.
    refresh_sem: Arc<Semaphore>,

    metrics: Arc<Metrics>,
}

impl Controller {
    pub fn new(
        cache: Arc<dyn Cache>,
        getter: Arc<dyn Getter>,
        persister: Arc<dyn Persister>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                getter,
                persister,
                docs: Group::new(),
                series: Group::new(),
                asins: Group::new(),
                edges: EdgeBuffer::new(),
                refresh_sem: Arc::new(Semaphore::new(REFRESH_CONCURRENCY)),
                metrics,
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Total children waiting in the denormalization queue.
    pub fn pending_denorm(&self) -> usize {
        self.inner.edges.len()
    }

    /// Author/work refreshes currently queued or running.
    pub fn refresh_waiting(&self) -> i64 {
        self.inner.metrics.controller.refresh_waiting()
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Load a book (edition), or return the cached value if one exists.
    /// The returned document is a work containing exactly this edition;
    /// the bulk handler merges these.
    pub async fn get_book(&self, book_id: i64) -> Result<DocumentTtl> {
        let key = book_key(book_id);
        let this = self.clone();
        self.inner
            .docs
            .run(&key, || async move { this.fetch_book(book_id).await })
            .await
    }

    /// Load a work with all currently-accumulated editions.
    pub async fn get_work(&self, work_id: i64) -> Result<DocumentTtl> {
        let key = work_key(work_id);
        let this = self.clone();
        self.inner
            .docs
            .run(&key, || async move { this.fetch_work(work_id).await })
            .await
    }

    /// Load an author with their works and editions.
    pub async fn get_author(&self, author_id: i64) -> Result<DocumentTtl> {
        // The "unknown author" IDs are never loadable, so short-circuit.
        if unknown_author(author_id) {
            return Err(Error::NotFound);
        }
        let key = author_key(author_id);
        let this = self.clone();
        self.inner
            .docs
            .run(&key, || async move { this.fetch_author(author_id).await })
            .await
    }

    /// Load a series document.
    pub async fn get_series(&self, series_id: i64) -> Result<Bytes> {
        let key = series_key(series_id);
        let this = self.clone();
        self.inner
            .series
            .run(&key, || async move { this.fetch_series(series_id).await })
            .await
    }

    /// Best-known edition ID for an ASIN, or not-found.
    pub async fn get_asin(&self, asin: &str) -> Result<i64> {
        let key = asin_key(asin);
        let this = self.clone();
        let asin = asin.to_string();
        self.inner
            .asins
            .run(&key, || async move { this.fetch_asin(&asin).await })
            .await
    }

    /// Query the metadata provider, short-circuiting ASIN-shaped queries
    /// through the local mapping.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResource>> {
        if crate::types::is_asin(query) {
            // Try an ASIN lookup and fall back to regular search.
            let results = self.search_asin(query).await;
            if !results.is_empty() {
                return Ok(results);
            }
        }
        self.inner.getter.search(query).await
    }

    /// Trending/popular work IDs, filtered down to the ones that won't
    /// 404 when the client follows up.
    pub async fn recommendations(&self, page: i64) -> Result<RecommendationsResource> {
        let mut recs = self.inner.getter.recommendations(page).await?;

        let checks = recs.work_ids.iter().map(|&work_id| {
            let this = self.clone();
            async move { this.get_work(work_id).await.ok().map(|_| work_id) }
        });
        recs.work_ids = futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(recs)
    }

    async fn search_asin(&self, asin: &str) -> Vec<SearchResource> {
        let Ok(edition_id) = self.get_asin(asin).await else {
            return Vec::new();
        };
        let Ok((work_bytes, _)) = self.get_book(edition_id).await else {
            return Vec::new();
        };
        let Ok(work) = serde_json::from_slice::<WorkResource>(&work_bytes) else {
            return Vec::new();
        };
        let (Some(book), Some(author)) = (work.books.first(), work.authors.first()) else {
            return Vec::new();
        };
        vec![SearchResource {
            book_id: book.foreign_id,
            work_id: work.foreign_id,
            author: SearchResourceAuthor {
                id: author.foreign_id,
            },
        }]
    }

    // ========================================================================
    // Fetch paths (inside the singleflight)
    // ========================================================================

    async fn fetch_book(&self, book_id: i64) -> Result<DocumentTtl> {
        let key = book_key(book_id);
        if let Some((bytes, ttl)) = self.inner.cache.get_with_ttl(&key).await {
            if ttl > Duration::ZERO {
                self.inner.metrics.cache.hit_inc();
                if is_missing(&bytes) {
                    return Err(Error::NotFound);
                }
                return Ok((bytes, ttl));
            }
        }
        self.inner.metrics.cache.miss_inc();

        let (work_bytes, work_id, author_id) = match self
            .inner
            .getter
            .get_book(book_id, Some(self.editions_callback()))
            .await
        {
            Err(Error::NotFound) => {
                self.cache_set(&key, Bytes::from_static(MISSING), MISSING_TTL)
                    .await;
                return Err(Error::NotFound);
            }
            Err(err) => {
                warn!(%err, book_id, "problem getting book");
                return Err(err);
            }
            Ok(fetched) => fetched,
        };

        let ttl = fuzz(EDITION_TTL, 2.0);
        self.cache_set(&key, work_bytes.clone(), ttl).await;

        if work_id > 0 {
            // Make sure the edition is included with the work, without
            // blocking the response.
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(err) = this.get_work(work_id).await {
                    warn!(%err, book_id, work_id, "skipping work denorm due to error");
                    return;
                }
                if let Err(err) = this.get_author(author_id).await {
                    warn!(%err, book_id, author_id, "skipping work denorm due to error");
                    return;
                }
                this.add(Edge::work(work_id, [book_id]));
            });
        }

        Ok((work_bytes, ttl))
    }

    async fn fetch_work(&self, work_id: i64) -> Result<DocumentTtl> {
        let key = work_key(work_id);
        let mut stale: Option<Bytes> = None;
        if let Some((bytes, ttl)) = self.inner.cache.get_with_ttl(&key).await {
            if ttl > Duration::ZERO {
                self.inner.metrics.cache.hit_inc();
                if is_missing(&bytes) {
                    return Err(Error::NotFound);
                }
                return Ok((bytes, ttl));
            }
            if !is_missing(&bytes) {
                stale = Some(bytes);
            }
        }
        self.inner.metrics.cache.miss_inc();

        let (work_bytes, author_id) = match self
            .inner
            .getter
            .get_work(work_id, Some(self.editions_callback()))
            .await
        {
            Err(Error::NotFound) => {
                self.cache_set(&key, Bytes::from_static(MISSING), MISSING_TTL)
                    .await;
                return Err(Error::NotFound);
            }
            Err(err) => {
                warn!(%err, work_id, "problem getting work");
                return Err(err);
            }
            Ok(fetched) => fetched,
        };

        let ttl = fuzz(WORK_TTL, 1.5);
        self.cache_set(&key, work_bytes.clone(), ttl).await;

        // Re-establish relationships in the background.
        self.spawn_refresh_work(work_id, author_id, stale.clone());

        // Return the last cached value to give the refresh time to
        // complete, preserving editions accumulated before expiry.
        match stale {
            Some(bytes) => Ok((bytes, ttl)),
            None => Ok((work_bytes, ttl)),
        }
    }

    /// Returns an author with however many works are populated so far.
    /// Additional works are populated asynchronously; the pre-refresh
    /// state is returned while a refresh is ongoing.
    async fn fetch_author(&self, author_id: i64) -> Result<DocumentTtl> {
        // Prefer the refresh snapshot when one exists: it holds the
        // author's state prior to refreshing, shielding clients from a
        // still-growing document.
        if let Some(bytes) = self.inner.cache.get(&refresh_author_key(author_id)).await {
            if is_missing(&bytes) {
                return Err(Error::NotFound);
            }
            return Ok((bytes, REFRESHING_TTL_HINT));
        }

        let key = author_key(author_id);
        let mut stale: Option<Bytes> = None;
        if let Some((bytes, ttl)) = self.inner.cache.get_with_ttl(&key).await {
            if ttl > Duration::ZERO {
                self.inner.metrics.cache.hit_inc();
                if is_missing(&bytes) {
                    return Err(Error::NotFound);
                }
                return Ok((bytes, ttl));
            }
            if !is_missing(&bytes) {
                stale = Some(bytes);
            }
        }
        self.inner.metrics.cache.miss_inc();

        let author_bytes = match self.inner.getter.get_author(author_id).await {
            Err(Error::NotFound) => {
                self.cache_set(&key, Bytes::from_static(MISSING), MISSING_TTL)
                    .await;
                return Err(Error::NotFound);
            }
            Err(err) => {
                warn!(%err, author_id, "problem getting author");
                return Err(err);
            }
            Ok(fetched) => fetched,
        };

        let ttl = fuzz(AUTHOR_TTL, 1.5);
        self.cache_set(&key, author_bytes.clone(), ttl).await;

        // From here prefer the last-known state. On a cold start there
        // is no previous state, so use what we just fetched.
        let snapshot = stale.unwrap_or_else(|| author_bytes.clone());

        // Mark the author as refreshing by recording its last known
        // state, then kick off the full load without blocking.
        if let Err(err) = self
            .inner
            .persister
            .persist(author_id, snapshot.clone())
            .await
        {
            warn!(%err, author_id, "problem persisting refresh");
        }
        self.spawn_refresh_author(author_id);

        Ok((snapshot, ttl))
    }

    async fn fetch_series(&self, series_id: i64) -> Result<Bytes> {
        let key = series_key(series_id);
        if let Some((bytes, ttl)) = self.inner.cache.get_with_ttl(&key).await {
            if ttl > Duration::ZERO {
                self.inner.metrics.cache.hit_inc();
                if is_missing(&bytes) {
                    return Err(Error::NotFound);
                }
                return Ok(bytes);
            }
        }
        self.inner.metrics.cache.miss_inc();

        debug!(series_id, "getting series");
        let series = match self.inner.getter.get_series(series_id).await {
            Ok(series) => series,
            Err(err) => {
                warn!(%err, series_id, "problem getting series");
                return Err(err);
            }
        };

        let out = Bytes::from(
            serde_json::to_vec(&series).map_err(|e| Error::Serialization(e.to_string()))?,
        );
        self.cache_set(&key, out.clone(), SERIES_TTL).await;
        Ok(out)
    }

    async fn fetch_asin(&self, asin: &str) -> Result<i64> {
        let bytes = self
            .inner
            .cache
            .get(&asin_key(asin))
            .await
            .ok_or(Error::NotFound)?;
        let record: AsinResource =
            serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(record.edition_id)
    }

    pub(crate) async fn set_asin(&self, asin: &str, edition_id: i64) -> Result<()> {
        let bytes = serde_json::to_vec(&AsinResource { edition_id })
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.cache_set(&asin_key(asin), Bytes::from(bytes), ASIN_TTL)
            .await;
        Ok(())
    }

    // ========================================================================
    // Background refresh
    // ========================================================================

    /// Resume any author refreshes that were in flight when the process
    /// last shut down. Call once on startup.
    pub async fn resume_refreshes(&self) -> Result<()> {
        let author_ids = self.inner.persister.persisted().await?;
        for author_id in author_ids {
            debug!(author_id, "resuming author refresh");
            self.spawn_refresh_author(author_id);
        }
        Ok(())
    }

    fn spawn_refresh_author(&self, author_id: i64) {
        self.inner.metrics.controller.refresh_waiting_add(1);
        let this = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = this.inner.refresh_sem.clone().acquire_owned().await else {
                return;
            };
            if AssertUnwindSafe(this.refresh_author(author_id))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(author_id, "panic during author refresh");
                // Still emit the completion marker so the snapshot is
                // cleaned up and the gauge stays balanced.
                this.add(Edge::refresh_done(author_id));
            }
        });
    }

    /// Walk the upstream's edition listing for an author, pull each
    /// edition through the cache, and enqueue one combined author edge.
    async fn refresh_author(&self, author_id: i64) {
        info!(author_id, "fetching all works for author");
        let start = Instant::now();

        let mut fetched = 0usize;
        let mut work_ids: BTreeSet<i64> = BTreeSet::new();

        let mut books = self.inner.getter.get_author_books(author_id);
        while let Some(book_id) = books.next().await {
            if fetched > MAX_REFRESH_EDITIONS {
                // Some authors have an obscene number of works. Give up.
                warn!(author_id, "found too many editions");
                break;
            }
            let (book_bytes, _) = match self.get_book(book_id).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, author_id, book_id, "problem getting book for author");
                    continue;
                }
            };
            let Ok(work) = serde_json::from_slice::<WorkResource>(&book_bytes) else {
                continue;
            };

            if let Some(primary) = work.authors.first() {
                if primary.foreign_id != author_id {
                    debug!(
                        author_id,
                        got = primary.foreign_id,
                        "skipping edition due to author mismatch"
                    );
                    continue;
                }
            }

            // Ensure the work is fetched before denormalizing it.
            if self.get_work(work.foreign_id).await.is_ok() {
                work_ids.insert(work.foreign_id);
            }
            fetched += 1;
        }

        let count = work_ids.len();
        if !work_ids.is_empty() {
            self.add(Edge::author(author_id, work_ids));
        }
        self.add(Edge::refresh_done(author_id));
        info!(
            author_id,
            count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "fetched all works for author"
        );
    }

    fn spawn_refresh_work(&self, work_id: i64, author_id: i64, stale: Option<Bytes>) {
        self.inner.metrics.controller.refresh_waiting_add(1);
        let this = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = this.inner.refresh_sem.clone().acquire_owned().await else {
                return;
            };
            if AssertUnwindSafe(this.refresh_work(work_id, author_id, stale))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(work_id, "panic during work refresh");
            }
            this.inner.metrics.controller.refresh_waiting_add(-1);
        });
    }

    /// Re-fetch the editions a now-expired work already accumulated so
    /// they survive the refresh, then re-enqueue the work's edges.
    async fn refresh_work(&self, work_id: i64, author_id: i64, stale: Option<Bytes>) {
        let mut cached_book_ids = Vec::new();
        if let Some(bytes) = stale {
            if let Ok(cached) = serde_json::from_slice::<WorkResource>(&bytes) {
                for book in &cached.books {
                    if self.get_book(book.foreign_id).await.is_ok() {
                        cached_book_ids.push(book.foreign_id);
                    }
                }
            }
        }

        if author_id > 0 {
            let _ = self.get_author(author_id).await; // Ensure fetched.
        }

        self.add(Edge::work(work_id, cached_book_ids));
        if author_id > 0 {
            // Ensure the work belongs to its author.
            self.add(Edge::author(author_id, [work_id]));
        }
    }

    // ========================================================================
    // Opportunistic edition persistence
    // ========================================================================

    /// Callback handed to the Getter so it can deliver all editions of a
    /// work from one upstream call. Only the controller writes the
    /// cache, so the Getter hands editions back here instead.
    pub(crate) fn editions_callback(&self) -> EditionsCallback {
        let this = self.clone();
        Arc::new(move |editions: Vec<WorkResource>| {
            let this = this.clone();
            tokio::spawn(async move {
                if AssertUnwindSafe(this.save_editions(editions))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("panic while saving editions");
                }
            });
        })
    }

    pub(crate) async fn save_editions(&self, editions: Vec<WorkResource>) {
        let mut work_id = 0i64;
        let mut book_ids = Vec::new();

        for edition in editions {
            if edition.books.len() != 1 {
                // Each entry is expected to be a single book wrapped in
                // a work.
                warn!(edition_work_id = edition.foreign_id, "malformed edition");
                continue;
            }
            if work_id == 0 {
                work_id = edition.foreign_id;
            }
            if edition.foreign_id != work_id {
                // Editions should all belong to the same work.
                warn!(
                    expected = work_id,
                    got = edition.foreign_id,
                    "work-edition mismatch"
                );
                continue;
            }
            let Some(author) = edition.authors.first() else {
                warn!(work_id = edition.foreign_id, "missing author");
                continue;
            };
            let author_id = author.foreign_id;
            if self.get_author(author_id).await.is_err() {
                continue; // Ensure fetched.
            }

            let Some(book) = edition.books.first() else {
                continue;
            };

            if !book.asin.is_empty() && crate::types::is_asin(&book.asin) {
                debug!(edition_id = book.foreign_id, asin = %book.asin, "found asin");
                if let Err(err) = self.set_asin(&book.asin, book.foreign_id).await {
                    warn!(%err, edition_id = book.foreign_id, "problem persisting asin");
                }
            }

            let Some(contributor) = book.contributors.first() else {
                warn!(
                    work_id = edition.foreign_id,
                    edition_id = book.foreign_id,
                    "missing contributors"
                );
                continue;
            };
            if contributor.foreign_id != author_id {
                continue; // Skip editions not attributed to this author.
            }

            let book_id = book.foreign_id;
            let Ok(out) = serde_json::to_vec(&edition) else {
                continue;
            };
            self.cache_set(&book_key(book_id), Bytes::from(out), fuzz(EDITION_TTL, 2.0))
                .await;
            book_ids.push(book_id);
        }

        if work_id == 0 || book_ids.is_empty() {
            return;
        }
        self.add(Edge::work(work_id, book_ids));
    }

    // ========================================================================
    // Denormalization loop
    // ========================================================================

    /// Drain the edge queue, applying denormalization steps serially.
    /// Updates to a given parent are thereby ordered; interleavings
    /// across parents are allowed. Runs until [`shutdown`](Self::shutdown)
    /// closes the queue.
    pub async fn run(&self) {
        while let Some(edge) = self.inner.edges.pop().await {
            let step = AssertUnwindSafe(tokio::time::timeout(
                EDGE_DEADLINE,
                self.handle_edge(&edge),
            ))
            .catch_unwind();
            match step.await {
                Ok(Ok(())) => {}
                Ok(Err(_elapsed)) => {
                    warn!(
                        parent_id = edge.parent_id,
                        kind = ?edge.kind,
                        "denormalization deadline exceeded"
                    );
                }
                Err(_panic) => {
                    error!(parent_id = edge.parent_id, kind = ?edge.kind, "denormalization panicked");
                }
            }
            self.inner
                .metrics
                .controller
                .denorm_waiting_set(self.inner.edges.len() as i64);
        }
    }

    async fn handle_edge(&self, edge: &Edge) {
        let child_ids: Vec<i64> = edge.child_ids.iter().copied().collect();
        match edge.kind {
            EdgeKind::Author => {
                if unknown_author(edge.parent_id) {
                    return;
                }
                if let Err(err) = self.denormalize_works(edge.parent_id, &child_ids).await {
                    warn!(%err, author_id = edge.parent_id, ?child_ids, "problem ensuring work");
                }
            }
            EdgeKind::Work => {
                if let Err(err) = self.denormalize_editions(edge.parent_id, &child_ids).await {
                    warn!(%err, work_id = edge.parent_id, ?child_ids, "problem ensuring edition");
                }
            }
            EdgeKind::RefreshDone => {
                self.inner.metrics.controller.refresh_waiting_add(-1);
                if let Err(err) = self.inner.persister.delete(edge.parent_id).await {
                    warn!(%err, author_id = edge.parent_id, "problem un-persisting refresh");
                }
            }
        }
    }

    /// Drain and stop: wait for in-flight refreshes to finish submitting
    /// work and for the queue to empty, then close the queue so
    /// [`run`](Self::run) exits.
    pub async fn shutdown(&self) {
        loop {
            if self.refresh_waiting() == 0 && self.inner.edges.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.inner.edges.close();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Queue an edge for denormalization.
    fn add(&self, edge: Edge) {
        self.inner.edges.push(edge);
        self.inner
            .metrics
            .controller
            .denorm_waiting_set(self.inner.edges.len() as i64);
    }

    async fn cache_set(&self, key: &str, bytes: Bytes, ttl: Duration) {
        self.inner.cache.set(key, bytes, ttl).await;
        self.inner.metrics.store.mark_dirty();
    }
}


#[cfg(test)]
mod tests {
    use super::testsupport::*;
    use super::*;
    use crate::cache::MemoryCache;
    use crate::persist::{CachePersister, Persister};
    use crate::types::{AuthorResource, BookResource};
    use std::collections::HashMap;

    fn sample_graph() -> (AuthorResource, WorkResource, BookResource) {
        let edition = BookResource {
            foreign_id: 6609765,
            language: "eng".into(),
            ..Default::default()
        };
        let mut work = WorkResource {
            foreign_id: 6803732,
            title: "The Sample".into(),
            books: vec![edition.clone()],
            ..Default::default()
        };
        let author = AuthorResource {
            foreign_id: 51942,
            name: "Sample Author".into(),
            works: vec![work.clone()],
            ..Default::default()
        };
        work.authors = vec![AuthorResource {
            foreign_id: 51942,
            name: "Sample Author".into(),
            ..Default::default()
        }];
        (author, work, edition)
    }

    /// Scenario: a cold edition read populates the work and the author
    /// via background denormalization, and a second (foreign-language)
    /// edition accumulates alongside the first.
    #[tokio::test]
    async fn test_incremental_denormalization() {
        let (author, work, english) = sample_graph();
        let german = BookResource {
            foreign_id: 6609766,
            language: "ger".into(),
            ..Default::default()
        };

        let cache = Arc::new(MemoryCache::new());
        let mut getter = ScriptedGetter::with_cache(cache.clone());
        getter
            .authors
            .insert(author.foreign_id, author_doc(&author));
        getter
            .works
            .insert(work.foreign_id, (work_doc(&work), author.foreign_id));
        getter.books.insert(
            english.foreign_id,
            (
                edition_doc(work.foreign_id, english.clone()),
                work.foreign_id,
                author.foreign_id,
            ),
        );
        getter.books.insert(
            german.foreign_id,
            (
                edition_doc(work.foreign_id, german.clone()),
                work.foreign_id,
                author.foreign_id,
            ),
        );
        getter.author_books.insert(
            author.foreign_id,
            vec![english.foreign_id, german.foreign_id],
        );

        let ctrl = controller_with(cache.clone(), Arc::new(getter));
        spawn_run(&ctrl);

        // The author initially carries only the seeded edition.
        let (author_bytes, _) = ctrl.get_author(author.foreign_id).await.unwrap();
        let initial: AuthorResource = serde_json::from_slice(&author_bytes).unwrap();
        assert_eq!(initial.works.len(), 1);
        assert_eq!(initial.works[0].books[0].foreign_id, english.foreign_id);

        // Fetching the foreign edition adds it to the work...
        ctrl.get_book(german.foreign_id).await.unwrap();

        let work_id = work.foreign_id;
        let c = ctrl.clone();
        eventually("work to accumulate both editions", move || {
            let c = c.clone();
            async move {
                let Ok((bytes, _)) = c.get_work(work_id).await else {
                    return false;
                };
                let w: WorkResource = serde_json::from_slice(&bytes).unwrap();
                w.books.iter().map(|b| b.foreign_id).collect::<Vec<_>>()
                    == vec![6609765, 6609766]
            }
        })
        .await;

        // ...and the updated work propagates up to the author.
        let author_id = author.foreign_id;
        let c = ctrl.clone();
        eventually("author to reflect both editions", move || {
            let c = c.clone();
            async move {
                let Ok((bytes, _)) = c.get_author(author_id).await else {
                    return false;
                };
                let a: AuthorResource = serde_json::from_slice(&bytes).unwrap();
                a.works.len() == 1
                    && a.works[0]
                        .books
                        .iter()
                        .map(|b| b.foreign_id)
                        .collect::<Vec<_>>()
                        == vec![6609765, 6609766]
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_author_short_circuits() {
        let cache = Arc::new(MemoryCache::new());
        let getter = Arc::new(ScriptedGetter::with_cache(cache.clone()));
        let ctrl = controller_with(cache, getter.clone());

        let err = ctrl.get_author(22294257).await.unwrap_err();
        assert_eq!(err, Error::NotFound);
        assert_eq!(getter.calls("get_author"), 0);
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let cache = Arc::new(MemoryCache::new());
        let getter = Arc::new(ScriptedGetter::with_cache(cache.clone()));
        let ctrl = controller_with(cache.clone(), getter.clone());

        // First miss hits upstream and caches the sentinel.
        assert_eq!(ctrl.get_work(99999).await.unwrap_err(), Error::NotFound);
        assert_eq!(getter.calls("get_work"), 1);
        assert!(is_missing(
            &cache.get(&work_key(99999)).await.unwrap()
        ));

        // Repeat lookups are served from the sentinel.
        assert_eq!(ctrl.get_work(99999).await.unwrap_err(), Error::NotFound);
        assert_eq!(ctrl.get_book(99999).await.unwrap_err(), Error::NotFound);
        assert_eq!(getter.calls("get_work"), 1);
        assert_eq!(getter.calls("get_book"), 1);
    }

    #[tokio::test]
    async fn test_cold_author_coalesces_to_one_fetch() {
        let (author, ..) = sample_graph();

        struct SlowGetter {
            inner: ScriptedGetter,
        }

        #[async_trait::async_trait]
        impl Getter for SlowGetter {
            async fn get_work(
                &self,
                work_id: i64,
                cb: Option<EditionsCallback>,
            ) -> Result<(Bytes, i64)> {
                self.inner.get_work(work_id, cb).await
            }
            async fn get_book(
                &self,
                book_id: i64,
                cb: Option<EditionsCallback>,
            ) -> Result<(Bytes, i64, i64)> {
                self.inner.get_book(book_id, cb).await
            }
            async fn get_author(&self, author_id: i64) -> Result<Bytes> {
                // Widen the race window so all callers pile up.
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.inner.get_author(author_id).await
            }
            fn get_author_books(
                &self,
                author_id: i64,
            ) -> futures::stream::BoxStream<'static, i64> {
                self.inner.get_author_books(author_id)
            }
            async fn get_series(&self, series_id: i64) -> Result<crate::types::SeriesResource> {
                self.inner.get_series(series_id).await
            }
            async fn search(&self, query: &str) -> Result<Vec<SearchResource>> {
                self.inner.search(query).await
            }
            async fn recommendations(&self, page: i64) -> Result<RecommendationsResource> {
                self.inner.recommendations(page).await
            }
        }

        let cache = Arc::new(MemoryCache::new());
        let mut inner = ScriptedGetter::with_cache(cache.clone());
        inner
            .authors
            .insert(author.foreign_id, author_doc(&author));
        let getter = Arc::new(SlowGetter { inner });
        let ctrl = controller_with(cache, getter.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctrl = ctrl.clone();
            let author_id = author.foreign_id;
            handles.push(tokio::spawn(
                async move { ctrl.get_author(author_id).await },
            ));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(getter.inner.calls("get_author"), 1);
    }

    /// Scenario: a large author's backlist streams in through the
    /// refresh pool; once done, the snapshot key is gone and the works
    /// have been folded in.
    #[tokio::test]
    async fn test_author_refresh_over_backlist() {
        let author_id = 4178;
        let mut getter_authors = HashMap::new();
        let seed = AuthorResource {
            foreign_id: author_id,
            name: "Prolific".into(),
            ..Default::default()
        };
        getter_authors.insert(author_id, author_doc(&seed));

        let cache = Arc::new(MemoryCache::new());
        let mut getter = ScriptedGetter::with_cache(cache.clone());
        getter.authors = getter_authors;

        // 25 editions spread over 5 works.
        let mut edition_ids = Vec::new();
        for edition_id in 1_000..1_025 {
            let work_id = 100 + edition_id % 5;
            let book = BookResource {
                foreign_id: edition_id,
                ..Default::default()
            };
            getter.books.insert(
                edition_id,
                (edition_doc(work_id, book), work_id, author_id),
            );
            edition_ids.push(edition_id);
        }
        for work_id in 100..105 {
            let work = WorkResource {
                foreign_id: work_id,
                books: vec![BookResource {
                    foreign_id: 1_000 + (work_id - 100),
                    ..Default::default()
                }],
                ..Default::default()
            };
            getter.works.insert(work_id, (work_doc(&work), author_id));
        }
        getter.author_books.insert(author_id, edition_ids);

        let persister = Arc::new(CachePersister::new(cache.clone()));
        let getter = Arc::new(getter);
        let ctrl = Controller::new(
            cache.clone(),
            getter.clone(),
            persister,
            Arc::new(Metrics::new().unwrap()),
        );
        spawn_run(&ctrl);

        ctrl.get_author(author_id).await.unwrap();

        // The refresh marker exists while the backlist loads, and is
        // cleared by the completion edge.
        let c = ctrl.clone();
        let cache2 = cache.clone();
        eventually("refresh to complete", move || {
            let cache = cache2.clone();
            let c = c.clone();
            async move {
                c.refresh_waiting() == 0
                    && cache.get(&refresh_author_key(author_id)).await.is_none()
            }
        })
        .await;

        let (author_bytes, _) = ctrl.get_author(author_id).await.unwrap();
        let refreshed: AuthorResource = serde_json::from_slice(&author_bytes).unwrap();
        assert!(refreshed.works.len() >= 5);
        let ids: Vec<i64> = refreshed.works.iter().map(|w| w.foreign_id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted, "works must be sorted and unique");
    }

    /// Restarting with a persisted `ra` marker resumes that refresh
    /// exactly once.
    #[tokio::test]
    async fn test_refresh_resumption() {
        let author_id = 4178;
        let seed = AuthorResource {
            foreign_id: author_id,
            ..Default::default()
        };

        let cache = Arc::new(MemoryCache::new());
        let persister = Arc::new(CachePersister::new(cache.clone()));
        // Simulate a crash mid-refresh: snapshot present from last run.
        persister.persist(author_id, author_doc(&seed)).await.unwrap();

        let mut getter = ScriptedGetter::with_cache(cache.clone());
        getter.authors.insert(author_id, author_doc(&seed));
        getter.author_books.insert(author_id, vec![]);
        let getter = Arc::new(getter);

        let ctrl = Controller::new(
            cache.clone(),
            getter.clone(),
            persister,
            Arc::new(Metrics::new().unwrap()),
        );
        spawn_run(&ctrl);
        ctrl.resume_refreshes().await.unwrap();

        let cache2 = cache.clone();
        eventually("resumed refresh to finish", move || {
            let cache = cache2.clone();
            async move { cache.get(&refresh_author_key(author_id)).await.is_none() }
        })
        .await;
        assert_eq!(getter.calls("get_author_books"), 1);
    }

    #[tokio::test]
    async fn test_save_editions_validates_and_enqueues() {
        let author = AuthorResource {
            foreign_id: 100,
            ..Default::default()
        };
        let good = |id: i64, asin: &str| WorkResource {
            foreign_id: 10,
            authors: vec![author.clone()],
            books: vec![BookResource {
                foreign_id: id,
                asin: asin.into(),
                contributors: vec![crate::types::ContributorResource {
                    foreign_id: 100,
                    role: "Author".into(),
                }],
                ..Default::default()
            }],
            ..Default::default()
        };

        let cache = Arc::new(MemoryCache::new());
        let mut getter = ScriptedGetter::with_cache(cache.clone());
        getter.authors.insert(100, author_doc(&author));
        let ctrl = controller_with(cache.clone(), Arc::new(getter));

        let other_work = WorkResource {
            foreign_id: 11, // Mismatched work: dropped.
            ..good(3, "")
        };
        let translated = WorkResource {
            // Contributor doesn't match the primary author: dropped.
            books: vec![BookResource {
                foreign_id: 4,
                contributors: vec![crate::types::ContributorResource {
                    foreign_id: 999,
                    role: "Translator".into(),
                }],
                ..Default::default()
            }],
            ..good(4, "")
        };

        ctrl.save_editions(vec![
            good(1, "B00ABC1234"),
            good(2, ""),
            other_work,
            translated,
        ])
        .await;

        // The two valid editions are cached individually.
        assert!(cache.get(&book_key(1)).await.is_some());
        assert!(cache.get(&book_key(2)).await.is_some());
        assert!(cache.get(&book_key(3)).await.is_none());
        assert!(cache.get(&book_key(4)).await.is_none());

        // The ASIN mapping was captured.
        assert_eq!(ctrl.get_asin("B00ABC1234").await.unwrap(), 1);

        // One combined edge for the kept editions.
        assert_eq!(ctrl.pending_denorm(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let cache = Arc::new(MemoryCache::new());
        let getter = Arc::new(ScriptedGetter::with_cache(cache.clone()));
        let ctrl = controller_with(cache, getter);

        let runner = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.run().await })
        };

        ctrl.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .expect("run loop should exit after drain")
            .unwrap();
    }
}
