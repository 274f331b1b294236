//! HTTP handlers.
//!
//! The handler layer defers all real work to the controller; it owns
//! muxing, response headers, and the error-to-status mapping. Response
//! bodies for the document endpoints are the cached bytes verbatim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{MatchedPath, Path, Query, RawQuery, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use spines::cache::{AUTHOR_TTL, SERIES_TTL};
use spines::error::Error;
use spines::metrics::Metrics;
use spines::types::{
    AuthorResource, RecommendationsResource, SearchResource, SeriesResource, WorkResource,
};
use spines::Controller;

/// Shared application state.
pub struct AppState {
    pub ctrl: Controller,
    pub metrics: Arc<Metrics>,
}

/// The client-facing shape of `/book/bulk`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BulkBookResource {
    #[serde(rename = "Works")]
    works: Vec<WorkResource>,
    #[serde(rename = "Series")]
    series: Vec<SeriesResource>,
    #[serde(rename = "Authors")]
    authors: Vec<AuthorResource>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Deserialize)]
struct RecommendationParams {
    #[serde(default)]
    page: i64,
}

/// Register all routes on a new router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/author/changed", get(author_changed))
        .route("/author/:id", get(get_author))
        .route("/work/:id", get(get_work))
        .route("/book/bulk", get(bulk_books).post(bulk_books_redirect))
        .route("/book/:id", get(get_book))
        .route("/series/:id", get(get_series))
        .route("/search", get(search))
        .route("/recommendations", get(recommendations))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            track_metrics,
        ))
        .with_state(state)
}

// ============================================================================
// Document endpoints
// ============================================================================

async fn get_author(
    State(state): State<Arc<AppState>>,
    Path(author_id): Path<i64>,
) -> Result<Response, ApiError> {
    let author_id = positive_id(author_id)?;
    let (bytes, ttl) = state.ctrl.get_author(author_id).await?;
    Ok(document_response(bytes, ttl, false))
}

async fn get_work(
    State(state): State<Arc<AppState>>,
    Path(work_id): Path<i64>,
) -> Result<Response, ApiError> {
    let work_id = positive_id(work_id)?;
    let (bytes, ttl) = state.ctrl.get_work(work_id).await?;
    Ok(document_response(bytes, ttl, false))
}

async fn get_book(
    State(state): State<Arc<AppState>>,
    Path(book_id): Path<i64>,
) -> Result<Response, ApiError> {
    let book_id = positive_id(book_id)?;
    let (bytes, ttl) = state.ctrl.get_book(book_id).await?;
    Ok(document_response(bytes, ttl, false))
}

async fn get_series(
    State(state): State<Arc<AppState>>,
    Path(series_id): Path<i64>,
) -> Result<Response, ApiError> {
    let series_id = positive_id(series_id)?;
    let bytes = state.ctrl.get_series(series_id).await?;
    Ok(document_response(bytes, SERIES_TTL, false))
}

/// Normally this returns IDs for all authors updated since the given
/// timestamp, which is uncachable and expensive. Returning an empty,
/// "limited" response forces the client to no-op and instead re-poll
/// `/author/{id}` on its own cadence, which hits cached entries.
async fn author_changed() -> Response {
    document_response(
        Bytes::from_static(br#"{"Limitted": true, "Ids": []}"#),
        AUTHOR_TTL,
        false,
    )
}

// ============================================================================
// Bulk endpoint
// ============================================================================

/// POST bodies aren't cachable, so redirect to a GET with query params.
async fn bulk_books_redirect(Json(ids): Json<Vec<i64>>) -> Result<Response, ApiError> {
    if ids.is_empty() {
        return Err(Error::BadRequest("no ids requested".into()).into());
    }
    let query: Vec<String> = ids.iter().map(|id| format!("id={id}")).collect();
    let target = format!("/book/bulk?{}", query.join("&"));
    debug!(%target, "redirecting bulk request");
    Ok(Redirect::to(&target).into_response())
}

/// Fan out over individual editions, which have usually been cached by
/// prior requests, then merge into one response.
async fn bulk_books(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let ids = parse_bulk_ids(query.as_deref().unwrap_or(""))?;

    let fetches = ids.iter().map(|&book_id| {
        let ctrl = state.ctrl.clone();
        async move { ctrl.get_book(book_id).await.ok() }
    });

    let mut result = BulkBookResource::default();
    for (bytes, _) in join_all(fetches).await.into_iter().flatten() {
        let Ok(work) = serde_json::from_slice::<WorkResource>(&bytes) else {
            continue;
        };
        // Authors need de-duping; there are at most a handful, so the
        // linear scan is fine.
        for author in &work.authors {
            if !result
                .authors
                .iter()
                .any(|a| a.foreign_id == author.foreign_id)
            {
                result.authors.push(author.clone());
            }
        }
        result.works.push(work);
    }

    // Most-rated editions first.
    result.works.sort_by_key(|w| {
        std::cmp::Reverse(w.books.first().map(|b| b.rating_count).unwrap_or(0))
    });

    let body =
        serde_json::to_vec(&result).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(document_response(
        Bytes::from(body),
        Duration::from_secs(24 * 60 * 60),
        true,
    ))
}

fn parse_bulk_ids(query: &str) -> Result<Vec<i64>, ApiError> {
    let mut ids = Vec::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key != "id" {
            continue;
        }
        let id: i64 = value
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid id {value:?}")))?;
        ids.push(id);
    }
    if ids.is_empty() {
        return Err(Error::BadRequest("no ids requested".into()).into());
    }
    Ok(ids)
}

// ============================================================================
// Search & recommendations
// ============================================================================

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchResource>>, ApiError> {
    if params.q.is_empty() {
        return Err(Error::BadRequest("empty query".into()).into());
    }
    Ok(Json(state.ctrl.search(&params.q).await?))
}

async fn recommendations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecommendationParams>,
) -> Result<Json<RecommendationsResource>, ApiError> {
    Ok(Json(state.ctrl.recommendations(params.page).await?))
}

// ============================================================================
// Health & metrics
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let text = state.metrics.gather()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

/// Record a latency histogram sample and maintain the in-flight gauge
/// for every matched route.
async fn track_metrics(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| normalize_pattern(p.as_str()))
        .unwrap_or_default();

    state.metrics.http.inflight.inc();
    let response = next.run(req).await;
    state.metrics.http.inflight.dec();

    if path.is_empty() {
        // Don't record traffic for unrecognized endpoints.
        return response;
    }
    let status = response.status().as_u16().to_string();
    state
        .metrics
        .http
        .requests
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .observe(start.elapsed().as_secs_f64());
    response
}

/// Derive a constant metric label from a route pattern:
///
///   "/author/:id"  → "/author"
///   "/book/bulk"   → "/book/bulk"
fn normalize_pattern(pattern: &str) -> String {
    let kept: Vec<&str> = pattern
        .split('/')
        .filter(|segment| !segment.starts_with(':'))
        .collect();
    let joined = kept.join("/");
    joined.trim_end_matches('/').to_string()
}

// ============================================================================
// Errors & headers
// ============================================================================

fn positive_id(id: i64) -> Result<i64, ApiError> {
    if id <= 0 {
        return Err(Error::BadRequest(format!("invalid id {id}")).into());
    }
    Ok(id)
}

/// Respond with raw document bytes and cache headers. `s-maxage`
/// controls CDN cache time; clients expire after an hour regardless.
fn document_response(bytes: Bytes, ttl: Duration, vary_params: bool) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CACHE_CONTROL,
            format!("public, s-maxage={}, max-age=3600", ttl.as_secs()),
        )
        // Ignore headers like User-Agent when serving cached responses.
        .header(header::VARY, "Content-Type,Accept-Encoding")
        .header(header::CONTENT_TYPE, "application/json");
    if !vary_params {
        // Ignore query params too.
        builder = builder.header("No-Vary-Search", "params");
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Wrapper mapping controller errors onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("/author/:id"), "/author");
        assert_eq!(normalize_pattern("/book/bulk"), "/book/bulk");
        assert_eq!(normalize_pattern("/"), "");
    }

    #[test]
    fn test_parse_bulk_ids() {
        assert_eq!(parse_bulk_ids("id=1&id=2&id=3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_bulk_ids("id=7&other=x").unwrap(), vec![7]);
        assert!(parse_bulk_ids("").is_err());
        assert!(parse_bulk_ids("other=x").is_err());
        assert!(parse_bulk_ids("id=notanumber").is_err());
    }

    #[test]
    fn test_cache_headers() {
        let response = document_response(
            Bytes::from_static(b"{}"),
            Duration::from_secs(3600),
            false,
        );
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CACHE_CONTROL).unwrap(),
            "public, s-maxage=3600, max-age=3600"
        );
        assert_eq!(headers.get("No-Vary-Search").unwrap(), "params");

        let response =
            document_response(Bytes::from_static(b"{}"), Duration::from_secs(60), true);
        assert!(response.headers().get("No-Vary-Search").is_none());
    }

    #[test]
    fn test_error_statuses() {
        let resp = ApiError(Error::NotFound).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError(Error::RateLimited).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let resp = ApiError(Error::BadRequest("x".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
