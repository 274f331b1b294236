//! Client-facing resource types.
//!
//! Field names follow the wire shape the library client expects, so
//! everything serializes with explicit PascalCase renames. The client is
//! known to panic on `null` where it expects a list or a rating, so list
//! and rating fields always default on decode and always serialize.
//!
//! Parent documents nest their children (author → works → books), and
//! the serialized model is cyclic in principle (a work also carries its
//! authors). The cycle is broken here by construction: these are plain
//! owned values rebuilt on every encode, never a long-lived object
//! graph. A nested author inside a work carries only the author's scalar
//! fields plus whatever works the producer chose to inline.

use serde::{Deserialize, Serialize};

/// An author (or more precisely, a primary contributor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,

    /// Opaque upstream identifier carried alongside the legacy numeric
    /// ID. Not interpreted here.
    #[serde(rename = "KCA", default)]
    pub kca: String,

    #[serde(rename = "Name", default)]
    pub name: String,

    #[serde(rename = "Description", default)]
    pub description: String,

    #[serde(rename = "ImageUrl", default)]
    pub image_url: String,

    #[serde(rename = "Url", default)]
    pub url: String,

    #[serde(rename = "RatingCount", default)]
    pub rating_count: i64,

    #[serde(rename = "AverageRating", default)]
    pub average_rating: f32,

    #[serde(rename = "Works", default)]
    pub works: Vec<WorkResource>,

    #[serde(rename = "Series", default)]
    pub series: Vec<SeriesResource>,
}

/// A work: the abstract identity of a title, independent of printing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,

    #[serde(rename = "KCA", default)]
    pub kca: String,

    #[serde(rename = "Title", default)]
    pub title: String,

    /// Title including subtitle. Substituted into `title` when works
    /// under an author collide, or when the work belongs to a series.
    #[serde(rename = "FullTitle", default)]
    pub full_title: String,

    #[serde(rename = "ShortTitle", default)]
    pub short_title: String,

    #[serde(rename = "Url", default)]
    pub url: String,

    #[serde(rename = "ReleaseDate", default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,

    /// Edition the upstream considers this work's best book.
    #[serde(rename = "BestBookId", default)]
    pub best_book_id: i64,

    #[serde(rename = "Genres", default)]
    pub genres: Vec<String>,

    #[serde(rename = "RatingCount", default)]
    pub rating_count: i64,

    #[serde(rename = "RatingSum", default)]
    pub rating_sum: i64,

    #[serde(rename = "AverageRating", default)]
    pub average_rating: f32,

    #[serde(rename = "Series", default)]
    pub series: Vec<SeriesResource>,

    /// Accumulated set of known editions, ascending by foreign ID so the
    /// denormalizer can upsert with a binary search.
    #[serde(rename = "Books", default)]
    pub books: Vec<BookResource>,

    /// `authors[0]` is the primary contributor.
    #[serde(rename = "Authors", default)]
    pub authors: Vec<AuthorResource>,
}

/// A book: one concrete edition of a work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,

    #[serde(rename = "KCA", default)]
    pub kca: String,

    #[serde(rename = "Asin", default)]
    pub asin: String,

    #[serde(rename = "Isbn13", default)]
    pub isbn13: String,

    #[serde(rename = "Title", default)]
    pub title: String,

    #[serde(rename = "FullTitle", default)]
    pub full_title: String,

    #[serde(rename = "ShortTitle", default)]
    pub short_title: String,

    #[serde(rename = "Description", default)]
    pub description: String,

    /// ISO-639-3 code.
    #[serde(rename = "Language", default)]
    pub language: String,

    #[serde(rename = "Format", default)]
    pub format: String,

    #[serde(rename = "EditionInformation", default)]
    pub edition_information: String,

    #[serde(rename = "Publisher", default)]
    pub publisher: String,

    #[serde(rename = "ImageUrl", default)]
    pub image_url: String,

    #[serde(rename = "IsEbook", default)]
    pub is_ebook: bool,

    #[serde(rename = "NumPages", default)]
    pub num_pages: i64,

    #[serde(rename = "RatingCount", default)]
    pub rating_count: i64,

    #[serde(rename = "RatingSum", default)]
    pub rating_sum: i64,

    #[serde(rename = "AverageRating", default)]
    pub average_rating: f64,

    #[serde(rename = "Url", default)]
    pub url: String,

    #[serde(rename = "ReleaseDate", default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,

    #[serde(rename = "Contributors", default)]
    pub contributors: Vec<ContributorResource>,
}

/// A person credited on an edition, with their role (author, translator,
/// illustrator, ...). The first contributor is treated as the canonical
/// author during denormalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,

    #[serde(rename = "Role", default)]
    pub role: String,
}

/// An ordered grouping of works. The works may span multiple authors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,

    #[serde(rename = "Title", default)]
    pub title: String,

    #[serde(rename = "Description", default)]
    pub description: String,

    #[serde(rename = "LinkItems", default)]
    pub link_items: Vec<SeriesWorkLinkResource>,
}

/// Membership of one work in a series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesWorkLinkResource {
    #[serde(rename = "ForeignWorkId")]
    pub foreign_work_id: i64,

    /// Free-form position ("1", "2.5", "prequel").
    #[serde(rename = "PositionInSeries", default)]
    pub position_in_series: String,

    #[serde(rename = "SeriesPosition", default)]
    pub series_position: i32,

    #[serde(rename = "Primary", default)]
    pub primary: bool,
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResource {
    #[serde(rename = "BookId")]
    pub book_id: i64,

    #[serde(rename = "WorkId")]
    pub work_id: i64,

    #[serde(rename = "Author")]
    pub author: SearchResourceAuthor,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResourceAuthor {
    #[serde(rename = "Id")]
    pub id: i64,
}

/// Trending/popular work IDs from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendationsResource {
    #[serde(rename = "WorkIds", default)]
    pub work_ids: Vec<i64>,
}

/// ASIN → best-known edition mapping, stored as its own cache record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsinResource {
    #[serde(rename = "EditionId")]
    pub edition_id: i64,
}

/// Check whether a query looks like an Amazon ASIN: ten characters,
/// leading `B`, uppercase alphanumeric.
pub fn is_asin(s: &str) -> bool {
    s.len() == 10
        && s.starts_with('B')
        && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}
