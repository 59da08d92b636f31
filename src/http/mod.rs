//! HTTP surface and request orchestration.
//!
//! Every inbound request flows through [`proxy_request`]: method gate,
//! stats page, conditional short-circuit, then cache hit/miss handling
//! with a transactional populate on miss. All listeners share one
//! [`ProxyState`]; the handler is reentrant and takes no locks of its
//! own.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderMap, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, error, instrument, warn};

use crate::{
    cache::{ByteCache, cache_key, envelope},
    config::Settings,
    stats::Stats,
    upstream::Fetch,
};

/// Constant validator shared by every cached object. Entries never
/// expire, so the validator carries no content information; any
/// `If-None-Match` therefore short-circuits to 304.
pub const ETAG_CACHE_FOREVER: &str = "W/\"CacheForever\"";

const CACHE_CONTROL_FOREVER: &str = "public, max-age=31536000";

/// Entries are cached indefinitely; eviction is the store's business.
const TTL_FOREVER: Option<Duration> = None;

/// Per-request policy resolved once at startup.
#[derive(Debug)]
pub struct RequestPolicy {
    pub stats_path: String,
    pub upstream_host: String,
    pub use_client_request_host: bool,
    pub get_timeout: Duration,
    pub config_echo: String,
}

impl RequestPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            stats_path: settings.server.stats_path.clone(),
            upstream_host: settings.upstream.host.clone(),
            use_client_request_host: settings.upstream.use_client_request_host,
            get_timeout: settings.cache.get_timeout,
            config_echo: settings.describe(),
        }
    }
}

/// Shared handler state: the cache store, the origin fetcher, the
/// stats counters, and the resolved request policy.
#[derive(Clone)]
pub struct ProxyState {
    pub store: Arc<dyn ByteCache>,
    pub fetcher: Arc<dyn Fetch>,
    pub stats: Arc<Stats>,
    pub policy: Arc<RequestPolicy>,
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new().fallback(proxy_request).with_state(state)
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn proxy_request(State(state): State<ProxyState>, request: Request) -> Response {
    if request.method() != axum::http::Method::GET {
        return plain_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

    // The stats page bypasses all cache logic. The full request target
    // is compared, so the stats path with a query string attached is an
    // ordinary asset.
    if path_and_query == state.policy.stats_path {
        return (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain")],
            state.stats.render(&state.policy.config_echo),
        )
            .into_response();
    }

    // Cached representations never go stale, so a conditional request
    // is answered without consulting the store or the origin. The
    // validator value is deliberately ignored.
    if request.headers().contains_key(IF_NONE_MATCH) {
        state.stats.record_conditional_hit();
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(ETAG, ETAG_CACHE_FOREVER)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::NOT_MODIFIED.into_response());
    }

    let host = request_host(&state.policy, request.headers());
    let key = cache_key(host.as_bytes(), path_and_query.as_bytes());
    let ctx = RequestContext::from_headers(request.headers(), &path_and_query);

    match state.store.get(&key, state.policy.get_timeout) {
        Ok(Some(blob)) => serve_hit(&state, blob, &ctx),
        Ok(None) => serve_miss(&state, key, &host, &path_and_query, &ctx).await,
        Err(err) => {
            error!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Cache lookup failed"
            );
            plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
        }
    }
}

fn serve_hit(state: &ProxyState, blob: Bytes, ctx: &RequestContext<'_>) -> Response {
    // A corrupt entry is a data-integrity bug, never a cache miss:
    // surface it instead of silently refetching.
    match envelope::decode(&blob) {
        Ok((content_type, body)) => {
            debug!(target: "raffica::proxy", outcome = "hit", bytes = body.len(), "Serving cached entry");
            state.stats.record_hit();
            state.stats.add_client_bytes(body.len() as u64);
            cached_response(&content_type, body)
        }
        Err(err) => {
            error!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Corrupt cache entry"
            );
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn serve_miss(
    state: &ProxyState,
    key: Vec<u8>,
    host: &str,
    path_and_query: &str,
    ctx: &RequestContext<'_>,
) -> Response {
    state.stats.record_miss();

    let fetched = match state.fetcher.fetch(host, path_and_query).await {
        Ok(fetched) => fetched,
        Err(err) => {
            warn!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Upstream fetch failed"
            );
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }
    };

    // The store preallocates by the declared size, so it is computed
    // before any transaction starts.
    let total_size = match envelope::encoded_len(&fetched.content_type, fetched.body.len()) {
        Ok(size) => size,
        Err(err) => {
            warn!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Refusing to cache upstream response"
            );
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }
    };

    let mut txn = match state.store.begin_put(&key, total_size, TTL_FOREVER) {
        Ok(txn) => txn,
        Err(err) => {
            warn!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Cannot start cache transaction"
            );
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }
    };

    let blob = match envelope::encode(&fetched.content_type, &fetched.body) {
        Ok(blob) => blob,
        Err(err) => {
            txn.rollback();
            warn!(
                target: "raffica::proxy",
                path = ctx.path,
                error = %err,
                "Cache transaction abandoned before write"
            );
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }
    };

    if let Err(err) = txn.write(&blob) {
        txn.rollback();
        warn!(
            target: "raffica::proxy",
            path = ctx.path,
            referer = ctx.referer,
            user_agent = ctx.user_agent,
            error = %err,
            "Cache transaction write failed"
        );
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
    }

    let committed = match txn.commit() {
        Ok(committed) => committed,
        Err(err) => {
            warn!(
                target: "raffica::proxy",
                path = ctx.path,
                referer = ctx.referer,
                user_agent = ctx.user_agent,
                error = %err,
                "Cache transaction commit failed"
            );
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable");
        }
    };

    state.stats.add_upstream_bytes(fetched.body.len() as u64);
    debug!(
        target: "raffica::proxy",
        outcome = "miss",
        bytes = fetched.body.len(),
        "Populated cache from upstream"
    );

    // Serve the just-committed entry so the miss path and the hit path
    // return byte-identical representations.
    match envelope::decode(&committed) {
        Ok((content_type, body)) => {
            state.stats.add_client_bytes(body.len() as u64);
            cached_response(&content_type, body)
        }
        Err(err) => {
            error!(
                target: "raffica::proxy",
                path = ctx.path,
                error = %err,
                "Committed entry failed to decode"
            );
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Host used for both the cache key and the upstream Host header,
/// fixed by the host-selection policy. Falls back to the configured
/// upstream host when a client omits its Host header.
fn request_host(policy: &RequestPolicy, headers: &HeaderMap) -> String {
    if policy.use_client_request_host
        && let Some(host) = headers.get(HOST).and_then(|value| value.to_str().ok())
    {
        return host.to_string();
    }
    policy.upstream_host.clone()
}

fn cached_response(content_type: &str, body: Bytes) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(CACHE_CONTROL, CACHE_CONTROL_FOREVER)
        .header(ETAG, ETAG_CACHE_FOREVER)
        .header(CONTENT_TYPE, content_type);
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        // Only reachable with a content-type that is not a valid
        // header value; serve the body under the default type.
        Err(_) => Response::builder()
            .status(StatusCode::OK)
            .header(CACHE_CONTROL, CACHE_CONTROL_FOREVER)
            .header(ETAG, ETAG_CACHE_FOREVER)
            .header(CONTENT_TYPE, envelope::DEFAULT_CONTENT_TYPE)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::OK.into_response()),
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

struct RequestContext<'a> {
    path: &'a str,
    referer: &'a str,
    user_agent: &'a str,
}

impl<'a> RequestContext<'a> {
    fn from_headers(headers: &'a HeaderMap, path: &'a str) -> Self {
        let header_str = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
        };
        Self {
            path,
            referer: header_str("referer"),
            user_agent: header_str("user-agent"),
        }
    }
}
