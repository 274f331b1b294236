//! Error types for the proxy

use thiserror::Error;

/// Main error type for the proxy.
///
/// Variants carry owned strings instead of source errors so that a
/// result can be cloned and fanned out to every caller coalesced behind
/// the same in-flight fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Upstream returned 404 or the entity is semantically absent.
    #[error("not found")]
    NotFound,

    /// Malformed input (zero ID, missing field). Never cached.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Upstream throttled us (429/403). Retryable by the client.
    #[error("rate limited")]
    RateLimited,

    /// Upstream responded with an unexpected status code.
    #[error("upstream status {0}")]
    UpstreamStatus(u16),

    /// Transient upstream failure. Never negative-cached.
    #[error("upstream: {0}")]
    Upstream(String),

    /// Encode/decode failure on a cached document.
    #[error("serialization: {0}")]
    Serialization(String),

    /// Storage error
    #[error("cache: {0}")]
    Cache(String),

    /// Configuration error
    #[error("configuration: {0}")]
    Configuration(String),

    /// The initiating caller abandoned an in-flight fetch.
    #[error("canceled")]
    Canceled,

    /// The operation has no upstream adapter wired.
    #[error("not implemented")]
    Unimplemented,
}

impl Error {
    /// Map an upstream HTTP status code into the taxonomy.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => Error::NotFound,
            403 | 429 => Error::RateLimited,
            400 => Error::BadRequest("upstream rejected request".into()),
            s => Error::UpstreamStatus(s),
        }
    }

    /// The HTTP status code this error surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            Error::NotFound => 404,
            Error::BadRequest(_) => 400,
            Error::RateLimited => 429,
            Error::UpstreamStatus(s) => *s,
            Error::Unimplemented => 501,
            _ => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
