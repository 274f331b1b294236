//! Denormalization: reconciling parent documents after children change.
//!
//! These passes are the only writer of parent documents after initial
//! population. Both follow the same shape: load the parent, fold in each
//! child by binary-searched upsert, re-encode, and skip the write (and
//! any upward propagation) when the digest of the rebuilt document
//! matches the cached copy.
//!
//! Works intentionally don't accumulate every edition that exists
//! upstream — only editions users actually looked up. A work with
//! thousands of printings is useless to crawl through; one that grows an
//! edition per language its readers use stays selectable.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::cache::{author_key, book_key, fuzz, work_key, AUTHOR_TTL, WORK_TTL};
use crate::edges::Edge;
use crate::error::{Error, Result};
use crate::etag::{Etag, EtagWriter};
use crate::types::{AuthorResource, SeriesResource, WorkResource};

use super::Controller;

/// At most this many distinct series are resolved per author pass. An
/// author whose works span more series than this keeps the remainder
/// un-inlined until a later pass.
const SERIES_FETCH_CAP: usize = 64;

/// Insert or replace by ID in a list kept ascending by ID.
pub(crate) fn upsert_by_id<T>(items: &mut Vec<T>, item: T, id: impl Fn(&T) -> i64) {
    let target = id(&item);
    match items.binary_search_by(|probe| id(probe).cmp(&target)) {
        Ok(i) => items[i] = item,
        Err(i) => items.insert(i, item),
    }
}

impl Controller {
    /// Ensure the given editions exist on the work. The target work is
    /// deserialized once no matter how many editions arrive, which is
    /// why edges coalesce by parent.
    pub(crate) async fn denormalize_editions(
        &self,
        work_id: i64,
        book_ids: &[i64],
    ) -> Result<()> {
        if book_ids.is_empty() {
            return Ok(());
        }

        let (work_bytes, _) = self
            .inner
            .getter
            .get_work(work_id, None)
            .await
            .map_err(|err| {
                debug!(%err, work_id, "problem getting work");
                err
            })?;
        let old_etag = Etag::of(&work_bytes);

        let mut work: WorkResource = match serde_json::from_slice(&work_bytes) {
            Ok(work) => work,
            Err(err) => {
                debug!(%err, work_id, "problem decoding work");
                let _ = self.inner.cache.expire(&work_key(work_id)).await;
                return Err(Error::Serialization(err.to_string()));
            }
        };

        debug!(work_id, ?book_ids, "ensuring work-edition edges");

        for &book_id in book_ids {
            let (edition_bytes, _, _) = match self.inner.getter.get_book(book_id, None).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    // Maybe the entry was deleted out from under us. Move on.
                    warn!(%err, work_id, book_id, "unable to denormalize edition");
                    continue;
                }
            };
            let edition: WorkResource = match serde_json::from_slice(&edition_bytes) {
                Ok(edition) => edition,
                Err(err) => {
                    warn!(%err, book_id, "problem decoding book");
                    let _ = self.inner.cache.expire(&book_key(book_id)).await;
                    continue;
                }
            };
            if edition.books.len() != 1 {
                warn!(book_id, count = edition.books.len(), "unexpected number of books");
                continue;
            }
            let Some(book) = edition.books.into_iter().next() else {
                continue;
            };

            // A merged edition can come back under a different ID than
            // the one requested; the canonical ID is the one to probe
            // for, otherwise merged editions duplicate.
            upsert_by_id(&mut work.books, book, |b| b.foreign_id);
        }

        let mut writer = EtagWriter::new(Vec::new());
        serde_json::to_writer(&mut writer, &work)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let (out, new_etag) = writer.finish();

        if new_etag == old_etag {
            // The work didn't change, so we're done.
            self.inner.metrics.controller.etag_matches_inc();
            return Ok(());
        }
        self.inner.metrics.controller.etag_mismatches_inc();

        self.cache_set(&work_key(work_id), Bytes::from(out), fuzz(WORK_TTL, 1.5))
            .await;

        // The work changed, so its authors need updating too.
        for author in &work.authors {
            self.add(Edge::author(author.foreign_id, [work_id]));
        }

        Ok(())
    }

    /// Ensure the given works exist on the author, then recompute the
    /// author's aggregates: ratings, resolved series, and disambiguated
    /// titles. Invoked in the background; this is what makes large
    /// authors workable.
    pub(crate) async fn denormalize_works(&self, author_id: i64, work_ids: &[i64]) -> Result<()> {
        if work_ids.is_empty() {
            return Ok(());
        }

        let (author_bytes, _) = match self.get_author(author_id).await {
            // Reload once if the cache was cold and upstream throttled.
            Err(Error::RateLimited) => self.get_author(author_id).await,
            loaded => loaded,
        }
        .map_err(|err| {
            debug!(%err, author_id, "problem loading author for denormalization");
            err
        })?;
        let old_etag = Etag::of(&author_bytes);

        let mut author: AuthorResource = match serde_json::from_slice(&author_bytes) {
            Ok(author) => author,
            Err(err) => {
                debug!(%err, author_id, "problem decoding author");
                let _ = self.inner.cache.expire(&author_key(author_id)).await;
                return Err(Error::Serialization(err.to_string()));
            }
        };

        debug!(author_id, ?work_ids, "ensuring author-work edges");

        for &work_id in work_ids {
            let (work_bytes, _) = match self.inner.getter.get_work(work_id, None).await {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(%err, author_id, work_id, "unable to denormalize work");
                    continue;
                }
            };
            let work: WorkResource = match serde_json::from_slice(&work_bytes) {
                Ok(work) => work,
                Err(err) => {
                    warn!(%err, work_id, "problem decoding work");
                    let _ = self.inner.cache.expire(&work_key(work_id)).await;
                    continue;
                }
            };
            if work.books.is_empty() {
                warn!(work_id = work.foreign_id, "work had no editions");
                continue;
            }

            // Merged works can also come back under a canonical ID.
            upsert_by_id(&mut author.works, work, |w| w.foreign_id);
        }

        // Count short titles so collisions can be disambiguated, and
        // aggregate ratings. Some upstreams store ratings on the work,
        // others on the edition; the edition counts only matter when the
        // work carries none.
        let mut titles: HashMap<String, usize> = HashMap::new();
        let mut rating_count = 0i64;
        let mut rating_sum = 0i64;
        let mut series_ids: Vec<i64> = Vec::new();
        let mut seen_series: BTreeSet<i64> = BTreeSet::new();

        for work in &author.works {
            let short = if work.short_title.is_empty() {
                &work.title
            } else {
                &work.short_title
            };
            *titles.entry(short.to_uppercase()).or_default() += 1;

            rating_count += work.rating_count;
            rating_sum += work.rating_sum;
            if work.rating_count == 0 {
                for book in &work.books {
                    rating_count += book.rating_count;
                    rating_sum += book.rating_sum;
                }
            }

            for series in &work.series {
                if seen_series.insert(series.foreign_id) {
                    series_ids.push(series.foreign_id);
                }
            }
        }

        if series_ids.len() > SERIES_FETCH_CAP {
            warn!(
                author_id,
                dropped = series_ids.len() - SERIES_FETCH_CAP,
                "capping series resolution"
            );
            series_ids.truncate(SERIES_FETCH_CAP);
        }

        // Fetch complete series documents; they can't be derived
        // correctly from the works alone.
        author.series = Vec::new();
        let fetches = series_ids.iter().map(|&series_id| {
            let this = self.clone();
            async move { this.get_series(series_id).await.ok() }
        });
        for series_bytes in join_all(fetches).await.into_iter().flatten() {
            let Ok(series) = serde_json::from_slice::<SeriesResource>(&series_bytes) else {
                continue;
            };
            if let Err(i) = author
                .series
                .binary_search_by(|s| s.foreign_id.cmp(&series.foreign_id))
            {
                author.series.insert(i, series);
            }
        }

        // Disambiguate works which share a title by substituting full
        // titles (with subtitles). Series members always get the full
        // title so their position reads in listings.
        for work in &mut author.works {
            let short = if work.short_title.is_empty() {
                work.title.clone()
            } else {
                work.short_title.clone()
            };
            let in_series = !work.series.is_empty();
            if !in_series && titles.get(&short.to_uppercase()).copied().unwrap_or(0) <= 1 {
                continue;
            }
            if work.full_title.is_empty() {
                continue;
            }
            work.title = work.full_title.clone();
            for book in &mut work.books {
                if book.full_title.is_empty() {
                    continue;
                }
                book.title = book.full_title.clone();
            }
        }

        if rating_count != 0 {
            author.rating_count = rating_count;
            author.average_rating = rating_sum as f32 / rating_count as f32;
        }

        let mut writer = EtagWriter::new(Vec::new());
        serde_json::to_writer(&mut writer, &author)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let (out, new_etag) = writer.finish();

        if new_etag == old_etag {
            // The author didn't change, so we're done.
            self.inner.metrics.controller.etag_matches_inc();
            return Ok(());
        }
        self.inner.metrics.controller.etag_mismatches_inc();

        self.cache_set(&author_key(author_id), Bytes::from(out), fuzz(AUTHOR_TTL, 1.5))
            .await;

        Ok(())
    }
}
