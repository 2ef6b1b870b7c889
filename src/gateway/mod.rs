//! The gateway: a middleware stack terminated by an [`Upstream`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::warn;

use crate::context::Context;
use crate::http::{Request, Response, ResponseSource, StatusCode};
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::upstream::Upstream;

/// An ordered middleware stack in front of one upstream service.
///
/// Layers run in the order they were added. The last handler in every chain
/// forwards the request to the upstream; if that fails the client gets a
/// `502 Bad Gateway` marked [`ResponseSource::Error`].
///
/// `Gateway` is cheap to clone and is shared by every connection task.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cache_entity::gateway::Gateway;
/// use cache_entity::middleware::LoggerMiddleware;
/// use cache_entity::upstream::HttpUpstream;
///
/// let gateway = Gateway::new(Arc::new(HttpUpstream::new("127.0.0.1:9000")))
///     .layer(LoggerMiddleware);
/// ```
#[derive(Clone)]
pub struct Gateway {
    middlewares: Vec<MiddlewareHandler>,
    terminal: MiddlewareHandler,
}

impl Gateway {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            middlewares: Vec::new(),
            terminal: from_middleware(Arc::new(Forward { upstream })),
        }
    }

    /// Appends a middleware to the stack.
    #[must_use]
    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Appends an already type-erased handler.
    #[must_use]
    pub fn layer_handler(mut self, handler: MiddlewareHandler) -> Self {
        self.middlewares.push(handler);
        self
    }

    /// Runs `request` through the stack and returns the client response.
    pub async fn handle(&self, request: Request) -> Response {
        let mut chain = Vec::with_capacity(self.middlewares.len() + 1);
        chain.extend(self.middlewares.iter().cloned());
        chain.push(Arc::clone(&self.terminal));

        Next::new(chain).run(Context::new(request)).await
    }
}

/// The terminal layer; never calls `next`.
struct Forward {
    upstream: Arc<dyn Upstream>,
}

impl Middleware for Forward {
    fn handle(&self, ctx: Context, _next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let upstream = Arc::clone(&self.upstream);
        Box::pin(async move { forward(upstream.as_ref(), ctx).await })
    }
}

async fn forward(upstream: &dyn Upstream, ctx: Context) -> Response {
    match upstream.send(&ctx).await {
        Ok(response) => response,
        Err(e) => {
            warn!(
                method = %ctx.method(),
                target = %ctx.path_with_query(),
                error = %e,
                "upstream request failed"
            );
            Response::new(StatusCode::BAD_GATEWAY)
                .header("Content-Type", "text/plain")
                .body("Bad Gateway")
                .with_source(ResponseSource::Error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use crate::upstream::UpstreamError;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Upstream for Echo {
        async fn send(&self, ctx: &Context) -> Result<Response, UpstreamError> {
            Ok(Response::new(StatusCode::OK)
                .body(ctx.path_with_query().to_owned())
                .with_source(ResponseSource::Service))
        }
    }

    struct Down;

    #[async_trait]
    impl Upstream for Down {
        async fn send(&self, _ctx: &Context) -> Result<Response, UpstreamError> {
            Err(UpstreamError::Incomplete)
        }
    }

    #[tokio::test]
    async fn empty_stack_forwards_upstream() {
        let gateway = Gateway::new(Arc::new(Echo));
        let response = gateway.handle(Request::new(Method::Get, "/a?b=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content().as_ref(), b"/a?b=1");
        assert_eq!(response.source(), ResponseSource::Service);
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let gateway = Gateway::new(Arc::new(Down));
        let response = gateway.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.source(), ResponseSource::Error);
    }

    #[tokio::test]
    async fn handler_layers_run_before_upstream() {
        let stamp: MiddlewareHandler = Arc::new(
            |ctx: Context, next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
                Box::pin(async move {
                    let mut response = next.run(ctx).await;
                    response.set_header("x-stamped", "1");
                    response
                })
            },
        );
        let gateway = Gateway::new(Arc::new(Echo)).layer_handler(stamp);

        let response = gateway.handle(Request::new(Method::Get, "/")).await;
        assert_eq!(response.headers().get("x-stamped"), Some("1"));
        assert_eq!(response.source(), ResponseSource::Service);
    }
}
