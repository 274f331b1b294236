//! Upstream adapter contract.
//!
//! A [`Getter`] translates one provider's API into the internal resource
//! model. Adapters own their transport stack, including rate limiting
//! and authentication; the controller owns the cache. Adapters must
//! never write to the cache themselves — the [`EditionsCallback`] exists
//! so an adapter that can cheaply enumerate a work's editions in one
//! upstream call can hand them to the controller for persistence instead.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{RecommendationsResource, SearchResource, SeriesResource, WorkResource};

/// Hands opportunistically loaded editions (each a single-book work
/// document) back to the controller. `None` means "don't bother".
pub type EditionsCallback = Arc<dyn Fn(Vec<WorkResource>) + Send + Sync>;

/// Core upstream operations the controller consumes.
///
/// Errors must distinguish not-found (negatively cached), bad-request,
/// rate-limited (retryable), and transient failures — see
/// [`Error::from_status`].
#[async_trait]
pub trait Getter: Send + Sync + 'static {
    /// Get the work with the given ID: a serialized work document and
    /// the primary author's ID (zero when unknown). When `save_editions`
    /// is provided the adapter may deliver all of the work's editions
    /// through it.
    async fn get_work(
        &self,
        work_id: i64,
        save_editions: Option<EditionsCallback>,
    ) -> Result<(Bytes, i64)>;

    /// Get an individual edition. The returned document is a work
    /// containing exactly the requested edition, along with the work and
    /// primary author IDs. A merged edition may come back under a
    /// different foreign ID than the one requested.
    async fn get_book(
        &self,
        book_id: i64,
        save_editions: Option<EditionsCallback>,
    ) -> Result<(Bytes, i64, i64)>;

    /// Get an author's details, seeded with at least one work.
    async fn get_author(&self, author_id: i64) -> Result<Bytes>;

    /// Lazily enumerate an author's edition IDs (not work IDs). The
    /// stream is finite and restartable; the consumer controls iteration
    /// and may stop early.
    fn get_author_books(&self, author_id: i64) -> BoxStream<'static, i64>;

    /// Get the works contained in a series. The works may not all share
    /// an author.
    async fn get_series(&self, series_id: i64) -> Result<SeriesResource>;

    /// Natural-language query against the upstream search index.
    async fn search(&self, query: &str) -> Result<Vec<SearchResource>>;

    /// Trending/popular work IDs.
    async fn recommendations(&self, page: i64) -> Result<RecommendationsResource>;
}

/// Placeholder adapter wired by the binary until a provider adapter is
/// configured. Every call reports the operation as unimplemented.
pub struct UnimplementedGetter;

#[async_trait]
impl Getter for UnimplementedGetter {
    async fn get_work(
        &self,
        _work_id: i64,
        _save_editions: Option<EditionsCallback>,
    ) -> Result<(Bytes, i64)> {
        Err(Error::Unimplemented)
    }

    async fn get_book(
        &self,
        _book_id: i64,
        _save_editions: Option<EditionsCallback>,
    ) -> Result<(Bytes, i64, i64)> {
        Err(Error::Unimplemented)
    }

    async fn get_author(&self, _author_id: i64) -> Result<Bytes> {
        Err(Error::Unimplemented)
    }

    fn get_author_books(&self, _author_id: i64) -> BoxStream<'static, i64> {
        Box::pin(futures::stream::empty())
    }

    async fn get_series(&self, _series_id: i64) -> Result<SeriesResource> {
        Err(Error::Unimplemented)
    }

    async fn search(&self, _query: &str) -> Result<Vec<SearchResource>> {
        Err(Error::Unimplemented)
    }

    async fn recommendations(&self, _page: i64) -> Result<RecommendationsResource> {
        Err(Error::Unimplemented)
    }
}
