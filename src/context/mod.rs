//! Per-request context — the inbound request plus everything a filter decides
//! about how it is forwarded upstream.
//!
//! A [`Context`] is created once per request and moved through the
//! middleware chain. Filters use it to read the request, add or override
//! headers on the upstream request, and switch on response buffering before
//! the upstream round-trip.

use crate::http::{Headers, Method, Request};

/// Per-request state shared by every filter in the pipeline.
///
/// # Examples
///
/// ```
/// use cache_entity::context::Context;
/// use cache_entity::http::{Method, Request};
///
/// let mut ctx = Context::new(Request::new(Method::Get, "/products?id=5"));
/// assert_eq!(ctx.path_with_query(), "/products?id=5");
/// assert_eq!(ctx.query_arg("id"), Some("5"));
///
/// ctx.set_upstream_header("Cache-Control", "no-cache");
/// assert_eq!(ctx.upstream_headers().get("cache-control"), Some("no-cache"));
/// ```
#[derive(Debug)]
pub struct Context {
    request: Request,
    upstream_headers: Headers,
    buffered: bool,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            upstream_headers: Headers::new(),
            buffered: false,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path_with_query(&self) -> &str {
        self.request.path_with_query()
    }

    /// Returns a decoded query argument of the inbound request.
    pub fn query_arg(&self, name: &str) -> Option<&str> {
        self.request.query_param(name)
    }

    /// Sets a header on the upstream request, replacing the inbound value if any.
    pub fn set_upstream_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.upstream_headers.set(name, value);
    }

    /// Header overrides to apply on top of the inbound headers when forwarding.
    pub fn upstream_headers(&self) -> &Headers {
        &self.upstream_headers
    }

    /// Requests that the upstream response be read in full before the
    /// response phase runs.
    pub fn enable_buffering(&mut self) {
        self.buffered = true;
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }
}
