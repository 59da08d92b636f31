//! End-to-end request flow through the proxy router.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
    routing::get,
};
use bytes::Bytes;
use raffica::{
    cache::{ByteCache, ShardedStore, StoreConfig, cache_key},
    config::{UpstreamProtocol, UpstreamSettings},
    http::{ETAG_CACHE_FOREVER, ProxyState, RequestPolicy, build_router},
    stats::Stats,
    upstream::{Fetch, FetchError, UpstreamFetcher, UpstreamResponse},
};
use tower::ServiceExt;

const UPSTREAM_HOST: &str = "origin.example.com";

/// Scripted origin: responses keyed by `host` + `path_and_query`.
struct ScriptedFetch {
    responses: Mutex<HashMap<String, UpstreamResponse>>,
    calls: AtomicUsize,
}

impl ScriptedFetch {
    fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn with(self, host: &str, path_and_query: &str, content_type: &str, body: &[u8]) -> Self {
        self.responses.lock().expect("poisoned").insert(
            format!("{host}{path_and_query}"),
            UpstreamResponse {
                content_type: content_type.to_string(),
                body: Bytes::copy_from_slice(body),
            },
        );
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn fetch(
        &self,
        host_for_request: &str,
        path_and_query: &str,
    ) -> Result<UpstreamResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("poisoned")
            .get(&format!("{host_for_request}{path_and_query}"))
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

struct Harness {
    router: Router,
    store: Arc<dyn ByteCache>,
    fetcher: Arc<ScriptedFetch>,
    stats: Arc<Stats>,
}

fn harness(fetcher: ScriptedFetch, use_client_request_host: bool) -> Harness {
    let store: Arc<dyn ByteCache> = Arc::new(
        ShardedStore::open(&StoreConfig {
            paths: Vec::new(),
            total_capacity_bytes: 10 * 1024 * 1024,
            max_items: 1024,
        })
        .expect("anonymous store"),
    );
    let fetcher = Arc::new(fetcher);
    let stats = Arc::new(Stats::default());
    let state = ProxyState {
        store: store.clone(),
        fetcher: fetcher.clone(),
        stats: stats.clone(),
        policy: Arc::new(RequestPolicy {
            stats_path: "/static_proxy_stats".to_string(),
            upstream_host: UPSTREAM_HOST.to_string(),
            use_client_request_host,
            get_timeout: Duration::from_millis(500),
            config_echo: format!("upstream_host={UPSTREAM_HOST}\n"),
        }),
    };
    Harness {
        router: build_router(state),
        store,
        fetcher,
        stats,
    }
}

async fn send(router: &Router, request: Request<Body>) -> Response {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router is infallible")
}

async fn body_bytes(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn header_str<'a>(response: &'a Response, name: header::HeaderName) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn miss_populates_cache_and_hit_skips_upstream() {
    let h = harness(
        ScriptedFetch::new().with(UPSTREAM_HOST, "/site.css", "text/css", b"body{}"),
        false,
    );

    let first = send(&h.router, get_request("/site.css")).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_str(&first, header::CONTENT_TYPE), Some("text/css"));
    assert_eq!(header_str(&first, header::ETAG), Some(ETAG_CACHE_FOREVER));
    assert_eq!(
        header_str(&first, header::CACHE_CONTROL),
        Some("public, max-age=31536000")
    );
    assert_eq!(&body_bytes(first).await[..], b"body{}");
    assert_eq!(h.fetcher.calls(), 1);

    let second = send(&h.router, get_request("/site.css")).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header_str(&second, header::CONTENT_TYPE), Some("text/css"));
    assert_eq!(&body_bytes(second).await[..], b"body{}");
    // Served from the cache, not refetched.
    assert_eq!(h.fetcher.calls(), 1);

    let s = h.stats.snapshot();
    assert_eq!(s.cache_misses, 1);
    assert_eq!(s.cache_hits, 1);
    assert_eq!(s.upstream_bytes, 6);
    assert_eq!(s.client_bytes, 12);
}

#[tokio::test]
async fn conditional_request_short_circuits_to_304() {
    let h = harness(ScriptedFetch::new(), false);

    let request = Request::builder()
        .uri("/anything.js")
        .header(header::IF_NONE_MATCH, "\"some-old-validator\"")
        .body(Body::empty())
        .expect("request");
    let response = send(&h.router, request).await;

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header_str(&response, header::ETAG), Some(ETAG_CACHE_FOREVER));
    // Neither the store nor the origin was consulted.
    assert_eq!(h.fetcher.calls(), 0);
    let key = cache_key(UPSTREAM_HOST.as_bytes(), b"/anything.js");
    assert!(
        h.store
            .get(&key, Duration::from_millis(100))
            .expect("get")
            .is_none()
    );
    assert_eq!(h.stats.snapshot().conditional_hits, 1);
}

#[tokio::test]
async fn non_get_methods_are_rejected() {
    let h = harness(ScriptedFetch::new(), false);

    let request = Request::builder()
        .method("POST")
        .uri("/site.css")
        .body(Body::from("data"))
        .expect("request");
    let response = send(&h.router, request).await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(&body_bytes(response).await[..], b"Method not allowed");
    assert_eq!(h.fetcher.calls(), 0);
}

#[tokio::test]
async fn upstream_failure_maps_to_service_unavailable() {
    // Scripted origin has no entry for this path, so the fetch fails.
    let h = harness(ScriptedFetch::new(), false);

    let response = send(&h.router, get_request("/missing.png")).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&body_bytes(response).await[..], b"Service unavailable");
    // The miss was counted even though the fetch failed.
    assert_eq!(h.stats.snapshot().cache_misses, 1);

    // Nothing was committed; a later request retries the origin.
    let key = cache_key(UPSTREAM_HOST.as_bytes(), b"/missing.png");
    assert!(
        h.store
            .get(&key, Duration::from_millis(100))
            .expect("get")
            .is_none()
    );
}

#[tokio::test]
async fn missing_content_type_defaults_to_octet_stream() {
    let h = harness(
        ScriptedFetch::new().with(UPSTREAM_HOST, "/blob.bin", "", b"\x00\x01\x02"),
        false,
    );

    let first = send(&h.router, get_request("/blob.bin")).await;
    assert_eq!(
        header_str(&first, header::CONTENT_TYPE),
        Some("application/octet-stream")
    );

    // The default is stored, so the hit path serves the same type.
    let second = send(&h.router, get_request("/blob.bin")).await;
    assert_eq!(
        header_str(&second, header::CONTENT_TYPE),
        Some("application/octet-stream")
    );
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn query_strings_key_distinct_entries() {
    let h = harness(
        ScriptedFetch::new()
            .with(UPSTREAM_HOST, "/img?size=1", "image/png", b"small")
            .with(UPSTREAM_HOST, "/img?size=2", "image/png", b"large"),
        false,
    );

    let small = send(&h.router, get_request("/img?size=1")).await;
    let large = send(&h.router, get_request("/img?size=2")).await;
    assert_eq!(&body_bytes(small).await[..], b"small");
    assert_eq!(&body_bytes(large).await[..], b"large");
    assert_eq!(h.fetcher.calls(), 2);

    // Both variants now hit.
    send(&h.router, get_request("/img?size=1")).await;
    send(&h.router, get_request("/img?size=2")).await;
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn client_host_policy_keys_and_forwards_per_host() {
    let h = harness(
        ScriptedFetch::new()
            .with("a.example.com", "/logo.svg", "image/svg+xml", b"<svg>a</svg>")
            .with("b.example.com", "/logo.svg", "image/svg+xml", b"<svg>b</svg>"),
        true,
    );

    let for_host = |host: &str| {
        Request::builder()
            .uri("/logo.svg")
            .header(header::HOST, host)
            .body(Body::empty())
            .expect("request")
    };

    let a = send(&h.router, for_host("a.example.com")).await;
    let b = send(&h.router, for_host("b.example.com")).await;
    assert_eq!(&body_bytes(a).await[..], b"<svg>a</svg>");
    assert_eq!(&body_bytes(b).await[..], b"<svg>b</svg>");
    assert_eq!(h.fetcher.calls(), 2);

    // Repeats stay separated per host and served from cache.
    let a_again = send(&h.router, for_host("a.example.com")).await;
    assert_eq!(&body_bytes(a_again).await[..], b"<svg>a</svg>");
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn fixed_host_policy_shares_one_entry_across_client_hosts() {
    let h = harness(
        ScriptedFetch::new().with(UPSTREAM_HOST, "/app.js", "text/javascript", b"js"),
        false,
    );

    for client_host in ["a.example.com", "b.example.com"] {
        let request = Request::builder()
            .uri("/app.js")
            .header(header::HOST, client_host)
            .body(Body::empty())
            .expect("request");
        let response = send(&h.router, request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    // One shared entry, one origin fetch.
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn stats_page_renders_counters_and_config() {
    let h = harness(
        ScriptedFetch::new().with(UPSTREAM_HOST, "/a.css", "text/css", b"a"),
        false,
    );

    send(&h.router, get_request("/a.css")).await;
    send(&h.router, get_request("/a.css")).await;

    let response = send(&h.router, get_request("/static_proxy_stats")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("text/plain"));

    let report = String::from_utf8(body_bytes(response).await.to_vec()).expect("utf8");
    assert!(report.contains(&format!("upstream_host={UPSTREAM_HOST}")));
    assert!(report.contains("Requests count: 2"));
    assert!(report.contains("Cache hits: 1"));
    assert!(report.contains("Cache misses: 1"));
    // The stats request itself is not counted.
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn stats_path_with_a_query_string_is_an_ordinary_asset() {
    let h = harness(
        ScriptedFetch::new().with(
            UPSTREAM_HOST,
            "/static_proxy_stats?x=1",
            "text/html",
            b"<html>asset</html>",
        ),
        false,
    );

    let response = send(&h.router, get_request("/static_proxy_stats?x=1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, header::CONTENT_TYPE), Some("text/html"));
    assert_eq!(&body_bytes(response).await[..], b"<html>asset</html>");
    assert_eq!(h.fetcher.calls(), 1);

    // The bare path still renders the report.
    let stats = send(&h.router, get_request("/static_proxy_stats")).await;
    assert_eq!(header_str(&stats, header::CONTENT_TYPE), Some("text/plain"));
    let report = String::from_utf8(body_bytes(stats).await.to_vec()).expect("utf8");
    assert!(report.contains("Cache misses: 1"));
}

#[tokio::test]
async fn corrupt_cache_entry_is_an_internal_error() {
    let h = harness(ScriptedFetch::new(), false);

    // Seed a blob that declares a longer content type than it carries.
    let key = cache_key(UPSTREAM_HOST.as_bytes(), b"/broken.bin");
    let garbage = [200u8];
    let mut txn = h
        .store
        .begin_put(&key, garbage.len(), None)
        .expect("begin_put");
    txn.write(&garbage).expect("write");
    txn.commit().expect("commit");

    let response = send(&h.router, get_request("/broken.bin")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(&body_bytes(response).await[..], b"Internal Server Error");
    // Corruption is surfaced, never masked by a refetch.
    assert_eq!(h.fetcher.calls(), 0);
}

#[tokio::test]
async fn concurrent_requests_for_one_asset_settle_into_the_cache() {
    let h = harness(
        ScriptedFetch::new().with(UPSTREAM_HOST, "/hot.css", "text/css", b"hot"),
        false,
    );

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let router = h.router.clone();
        tasks.push(tokio::spawn(async move {
            let response = send(&router, get_request("/hot.css")).await;
            assert_eq!(response.status(), StatusCode::OK);
            body_bytes(response).await
        }));
    }
    for task in tasks {
        assert_eq!(&task.await.expect("task")[..], b"hot");
    }

    let s = h.stats.snapshot();
    assert_eq!(s.cache_hits + s.cache_misses, 16);
    // At least one request populated the cache; afterwards it serves hits.
    assert!(s.cache_misses >= 1);
    let tail = send(&h.router, get_request("/hot.css")).await;
    assert_eq!(tail.status(), StatusCode::OK);
    assert_eq!(h.stats.snapshot().cache_hits, s.cache_hits + 1);
}

/// Spin up a real origin on an ephemeral port and drive the reqwest-based
/// fetcher against it.
async fn spawn_origin(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind origin");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service()).await;
    });
    addr
}

#[tokio::test]
async fn upstream_fetcher_round_trips_against_a_real_origin() {
    let origin = Router::new().route(
        "/styles/app.css",
        get(|| async {
            (
                [(header::CONTENT_TYPE, "text/css")],
                Bytes::from_static(b"h1{color:red}"),
            )
        }),
    );
    let addr = spawn_origin(origin).await;

    let fetcher = UpstreamFetcher::new(&UpstreamSettings {
        host: addr.to_string(),
        protocol: UpstreamProtocol::Http,
        use_client_request_host: false,
        max_idle_connections: 4,
    })
    .expect("fetcher");

    let response = fetcher
        .fetch(&addr.to_string(), "/styles/app.css")
        .await
        .expect("fetch");
    assert_eq!(response.content_type, "text/css");
    assert_eq!(&response.body[..], b"h1{color:red}");
}

#[tokio::test]
async fn upstream_fetcher_rejects_non_200_statuses() {
    let origin = Router::new();
    let addr = spawn_origin(origin).await;

    let fetcher = UpstreamFetcher::new(&UpstreamSettings {
        host: addr.to_string(),
        protocol: UpstreamProtocol::Http,
        use_client_request_host: false,
        max_idle_connections: 4,
    })
    .expect("fetcher");

    let err = fetcher
        .fetch(&addr.to_string(), "/nope")
        .await
        .expect_err("must fail");
    assert!(matches!(err, FetchError::Status(404)));
}
