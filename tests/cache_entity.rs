//! End-to-end behaviour of the cache middleware inside a gateway, with a
//! scripted upstream and the in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cache_entity::cache::{CacheEntity, CacheEntityMiddleware, MemoryStore, StoreError, TaggedStore, derive_key};
use cache_entity::config::CacheConfig;
use cache_entity::context::Context;
use cache_entity::gateway::Gateway;
use cache_entity::http::{Method, Request, Response, ResponseSource, StatusCode};
use cache_entity::middleware::LoggerMiddleware;
use cache_entity::upstream::{Upstream, UpstreamError};

#[derive(Debug, Clone)]
struct Seen {
    method: Method,
    target: String,
    cache_control: Option<String>,
}

/// Answers from a table keyed by path; unknown paths get a plain 200.
#[derive(Default)]
struct StubUpstream {
    routes: Mutex<HashMap<String, Response>>,
    seen: Mutex<Vec<Seen>>,
}

impl StubUpstream {
    fn route(&self, path: &str, response: Response) {
        self.routes.lock().unwrap().insert(path.to_owned(), response);
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last(&self) -> Seen {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn send(&self, ctx: &Context) -> Result<Response, UpstreamError> {
        self.seen.lock().unwrap().push(Seen {
            method: ctx.method().clone(),
            target: ctx.path_with_query().to_owned(),
            cache_control: ctx.upstream_headers().get("cache-control").map(str::to_owned),
        });

        let routed = self.routes.lock().unwrap().get(ctx.request().path()).cloned();
        let response = routed.unwrap_or_else(|| {
            Response::new(StatusCode::OK).body(format!("served {}", ctx.path_with_query()))
        });
        Ok(response.with_source(ResponseSource::Service))
    }
}

struct DownStore;

#[async_trait]
impl TaggedStore for DownStore {
    async fn set(&self, _: &str, _: &[u8], _: &[String], _: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn invalidate(&self, _: &str) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

struct Harness {
    gateway: Gateway,
    upstream: Arc<StubUpstream>,
}

impl Harness {
    fn with_store(store: Arc<dyn TaggedStore>) -> Self {
        let upstream = Arc::new(StubUpstream::default());
        let entity = CacheEntity::new(Arc::new(CacheConfig::default()), store);
        let gateway = Gateway::new(upstream.clone())
            .layer(LoggerMiddleware)
            .layer(CacheEntityMiddleware::new(Arc::new(entity)));
        Self { gateway, upstream }
    }

    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    async fn get(&self, target: &str) -> Response {
        self.gateway.handle(Request::new(Method::Get, target)).await
    }

    async fn send(&self, method: Method, target: &str) -> Response {
        self.gateway.handle(Request::new(method, target)).await
    }
}

fn json(body: &str) -> Response {
    Response::new(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(body.to_owned())
}

fn cache_status(response: &Response) -> Option<&str> {
    response.headers().get("x-cache-status")
}

#[tokio::test]
async fn miss_hit_invalidate_miss() {
    let h = Harness::new();
    h.upstream.route(
        "/products",
        json(r#"{"id":5}"#).header("x-cache-tags", "cache:products,cache:product:5"),
    );

    let first = h.get("/products?id=5").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(cache_status(&first), Some("MISS"));
    assert_eq!(first.content().as_ref(), br#"{"id":5}"#);
    let key = derive_key("/products?id=5");
    assert_eq!(first.headers().get("x-cache-key"), Some(key.as_str()));
    assert_eq!(h.upstream.last().cache_control.as_deref(), Some("no-cache"));

    let second = h.get("/products?id=5").await;
    assert_eq!(cache_status(&second), Some("HIT"));
    assert_eq!(second.content().as_ref(), br#"{"id":5}"#);
    assert_eq!(second.headers().get("content-type"), Some("application/json"));
    assert_eq!(second.source(), ResponseSource::Exit);
    assert_eq!(h.upstream.calls(), 1);

    let admin = h.get("/invalidate_cache?cache_tags=cache:products").await;
    assert_eq!(admin.status(), StatusCode::OK);
    assert_eq!(admin.content().as_ref(), br#"{"removed":true}"#);
    assert_eq!(h.upstream.calls(), 1);

    let third = h.get("/products?id=5").await;
    assert_eq!(cache_status(&third), Some("MISS"));
    assert_eq!(h.upstream.calls(), 2);
}

#[tokio::test]
async fn shared_tag_cascades_across_entries() {
    let h = Harness::new();
    h.upstream.route("/a", json("a").header("x-cache-tags", "t1, shared"));
    h.upstream.route("/b", json("b").header("x-cache-tags", "shared"));
    h.upstream.route("/c", json("c").header("x-cache-tags", "t3"));

    for target in ["/a", "/b", "/c"] {
        h.get(target).await;
    }
    assert_eq!(h.upstream.calls(), 3);

    h.get("/invalidate_cache?cache_tags=shared").await;

    assert_eq!(cache_status(&h.get("/a").await), Some("MISS"));
    assert_eq!(cache_status(&h.get("/b").await), Some("MISS"));
    assert_eq!(cache_status(&h.get("/c").await), Some("HIT"));
    assert_eq!(h.upstream.calls(), 5);
}

#[tokio::test]
async fn untagged_entry_is_dropped_by_its_own_key() {
    let h = Harness::new();
    h.get("/plain").await;
    assert_eq!(cache_status(&h.get("/plain").await), Some("HIT"));

    let key = derive_key("/plain");
    h.get(&format!("/invalidate_cache?cache_tags={key}")).await;
    assert_eq!(cache_status(&h.get("/plain").await), Some("MISS"));
}

#[tokio::test]
async fn write_response_invalidates_named_tags() {
    let h = Harness::new();
    h.upstream.route("/products", json("[]").header("x-cache-tags", "cache:products"));
    h.upstream.route(
        "/orders",
        Response::new(StatusCode::CREATED).header("x-invalidate-cache-tags", "cache:products"),
    );

    h.get("/products").await;
    assert_eq!(cache_status(&h.get("/products").await), Some("HIT"));

    let created = h.send(Method::Post, "/orders").await;
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(cache_status(&created), None);
    assert_eq!(h.upstream.last().cache_control, None);

    assert_eq!(cache_status(&h.get("/products").await), Some("MISS"));
}

#[tokio::test]
async fn non_get_requests_are_never_cached() {
    let h = Harness::new();
    h.send(Method::Put, "/items/1").await;
    h.send(Method::Put, "/items/1").await;
    assert_eq!(h.upstream.calls(), 2);
    assert_eq!(h.upstream.last().method, Method::Put);

    // A GET for the same target still misses first.
    assert_eq!(cache_status(&h.get("/items/1").await), Some("MISS"));
}

#[tokio::test]
async fn admin_invalidation_is_idempotent() {
    let h = Harness::new();
    for _ in 0..2 {
        let response = h.get("/invalidate_cache?cache_tags=nothing,here").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content().as_ref(), br#"{"removed":true}"#);
    }
    let bare = h.get("/invalidate_cache").await;
    assert_eq!(bare.status(), StatusCode::OK);
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn upstream_errors_are_not_cached() {
    let h = Harness::new();
    h.upstream.route("/flaky", Response::new(StatusCode::SERVICE_UNAVAILABLE).body("down"));

    let first = h.get("/flaky").await;
    assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(cache_status(&first), Some("MISS"));

    h.get("/flaky").await;
    assert_eq!(h.upstream.calls(), 2);
}

#[tokio::test]
async fn query_string_is_part_of_the_key() {
    let h = Harness::new();
    h.get("/products?id=5").await;
    assert_eq!(cache_status(&h.get("/products?id=6").await), Some("MISS"));
    assert_eq!(cache_status(&h.get("/products?id=5").await), Some("HIT"));
    assert_eq!(h.upstream.last().target, "/products?id=6");
}

#[tokio::test]
async fn store_outage_degrades_to_pass_through() {
    let h = Harness::with_store(Arc::new(DownStore));

    let first = h.get("/products").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(cache_status(&first), Some("MISS"));

    let second = h.get("/products").await;
    assert_eq!(cache_status(&second), Some("MISS"));
    assert_eq!(h.upstream.calls(), 2);

    let admin = h.get("/invalidate_cache?cache_tags=cache:products").await;
    assert_eq!(admin.content().as_ref(), br#"{"removed":true}"#);
}
