//! The cache entity controller.
//!
//! Each request moves through three phases, and each phase hands the next
//! one a token that only it can produce:
//!
//! ```text
//! access(ctx) ──► Access::Exit(response)             (admin call or cache hit)
//!             └─► Access::Forward(Evaluated)
//!                    Evaluated::rewrite(ctx) ──► Buffering
//!                       (upstream round-trip)
//!                       response(Buffering, upstream response) ──► Response
//! ```
//!
//! The controller holds no per-request state between calls; everything
//! durable lives in the [`TaggedStore`]. Store failures never fail the
//! request: reads degrade to a miss and writes are skipped.

use std::sync::Arc;

use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::key::{CacheKey, derive_key};
use super::store::TaggedStore;
use super::tags::parse_optional_tags;
use crate::config::CacheConfig;
use crate::context::Context;
use crate::http::{Method, Response, ResponseSource, StatusCode};

/// Upstream → gateway: tags to store the response under.
pub const CACHE_TAGS_HEADER: &str = "x-cache-tags";
/// Upstream → gateway: tags to invalidate because of this response.
pub const INVALIDATE_TAGS_HEADER: &str = "x-invalidate-cache-tags";
/// Gateway → client: key the response is stored under.
pub const CACHE_KEY_HEADER: &str = "x-cache-key";
/// Gateway → client: `HIT` or `MISS`.
pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

/// Any request path containing this marker is an administrative invalidation.
pub const ADMIN_PATH_MARKER: &str = "invalidate_cache";
/// Query argument carrying the comma-separated tags of an admin invalidation.
pub const ADMIN_TAGS_ARG: &str = "cache_tags";

const REMOVED_BODY: &str = r#"{"removed":true}"#;

/// Outcome of the access phase.
#[derive(Debug)]
#[must_use]
pub enum Access {
    /// Answer the client now; no upstream call and no further phases.
    Exit(Response),
    /// Forward the request upstream, continuing with [`Evaluated::rewrite`].
    Forward(Evaluated),
}

/// A request that passed the access phase and is headed upstream.
#[derive(Debug)]
pub struct Evaluated {
    key: CacheKey,
    method: Method,
}

impl Evaluated {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The rewrite phase: switch on response buffering for the upstream call.
    pub fn rewrite(self, ctx: &mut Context) -> Buffering {
        ctx.enable_buffering();
        Buffering {
            key: self.key,
            method: self.method,
        }
    }
}

/// A request whose upstream response will be fully buffered.
#[derive(Debug)]
pub struct Buffering {
    key: CacheKey,
    method: Method,
}

impl Buffering {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Tag-invalidated response cache controller.
///
/// Cheap to share: wrap it in an `Arc` and hand it to every request.
pub struct CacheEntity {
    config: Arc<CacheConfig>,
    store: Arc<dyn TaggedStore>,
}

impl CacheEntity {
    pub fn new(config: Arc<CacheConfig>, store: Arc<dyn TaggedStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The access phase, run before the request is routed upstream.
    ///
    /// - A target (path or query) containing [`ADMIN_PATH_MARKER`] invalidates the tags listed in
    ///   [`ADMIN_TAGS_ARG`] and answers `200 {"removed":true}`. A missing or
    ///   empty list is a no-op with the same answer.
    /// - A `GET` with a stored, non-empty entry is answered from the cache.
    /// - A `GET` miss is forwarded with `Cache-Control: no-cache`.
    /// - Anything else is forwarded untouched.
    pub async fn access(&self, ctx: &mut Context) -> Access {
        let key = derive_key(ctx.path_with_query());

        if ctx.path_with_query().contains(ADMIN_PATH_MARKER) {
            let tags = parse_optional_tags(ctx.query_arg(ADMIN_TAGS_ARG));
            if tags.is_empty() {
                debug!(path = %ctx.path_with_query(), "admin invalidation without tags");
            } else {
                self.invalidate(tags).await;
            }
            return Access::Exit(removed_response());
        }

        if ctx.method() == &Method::Get {
            if let Some(entry) = self.lookup(&key).await {
                debug!(key = %key, "cache hit");
                return Access::Exit(hit_response(entry));
            }
            debug!(key = %key, "cache miss");
            ctx.set_upstream_header("Cache-Control", "no-cache");
        }

        Access::Forward(Evaluated {
            key,
            method: ctx.method().clone(),
        })
    }

    /// The response phase, run once the upstream (or the gateway, on error)
    /// has produced a response.
    ///
    /// Tags named in [`INVALIDATE_TAGS_HEADER`] are invalidated whatever the
    /// response is. A `GET` answered by the upstream service is marked as a
    /// miss, and stored under the tags in [`CACHE_TAGS_HEADER`] (or under its
    /// own key when there are none) if its status is `2xx`.
    pub async fn response(&self, state: Buffering, mut response: Response) -> Response {
        let Buffering { key, method } = state;

        let mut tags = parse_optional_tags(response.headers().get(CACHE_TAGS_HEADER));
        if tags.is_empty() {
            tags.push(key.to_string());
        }

        let stale = parse_optional_tags(response.headers().get(INVALIDATE_TAGS_HEADER));
        if !stale.is_empty() {
            self.invalidate(stale).await;
        }

        if response.source() != ResponseSource::Service || method != Method::Get {
            return response;
        }

        let mut snapshot = response.headers().clone();
        snapshot.strip_hop_by_hop();
        snapshot.remove(CACHE_STATUS_HEADER);
        snapshot.set(CACHE_KEY_HEADER, key.as_str());

        response.set_header(CACHE_KEY_HEADER, key.as_str());
        response.set_header(CACHE_STATUS_HEADER, "MISS");
        response.set_header("Cache-Control", "no-cache");

        if response.status().is_success() {
            let entry = CacheEntry::new(response.content().clone(), &snapshot);
            self.store(key, entry, tags).await;
        } else {
            debug!(key = %key, status = %response.status(), "not storing unsuccessful response");
        }

        response
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let raw = match self.store.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        match CacheEntry::decode(&raw) {
            Ok(entry) if entry.body.is_empty() => None,
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt cache entry, treating as miss");
                None
            }
        }
    }

    // Writes run on their own task so a client disconnect cannot cut them short.
    async fn store(&self, key: CacheKey, entry: CacheEntry, tags: Vec<String>) {
        let value = match entry.encode() {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode cache entry");
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let ttl = self.config.default_ttl;
        let task = tokio::spawn(async move {
            let result = store.set(key.as_str(), &value, &tags, ttl).await;
            (key, tags, result)
        });

        match task.await {
            Ok((key, tags, Ok(()))) => debug!(key = %key, tags = ?tags, "stored cache entry"),
            Ok((key, _, Err(e))) => warn!(key = %key, error = %e, "cache write failed, skipping"),
            Err(e) => warn!(error = %e, "cache write task failed"),
        }
    }

    async fn invalidate(&self, tags: Vec<String>) {
        let store = Arc::clone(&self.store);
        let task = tokio::spawn(async move {
            let result = store.invalidate_many(&tags).await;
            (tags, result)
        });

        match task.await {
            Ok((tags, Ok(removed))) => debug!(tags = ?tags, removed, "invalidated cache tags"),
            Ok((tags, Err(e))) => warn!(tags = ?tags, error = %e, "cache invalidation failed"),
            Err(e) => warn!(error = %e, "cache invalidation task failed"),
        }
    }
}

fn removed_response() -> Response {
    Response::new(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(REMOVED_BODY)
}

fn hit_response(entry: CacheEntry) -> Response {
    let mut response = Response::new(StatusCode::OK).with_headers(entry.headers());
    response.set_header(CACHE_STATUS_HEADER, "HIT");
    response.body_bytes(entry.body)
}
