//! Client-facing listener for the gateway.
//!
//! Each accepted connection gets its own Tokio task. Requests are framed by
//! `Content-Length` only, tagged with the client's address, and handed to the
//! handler one at a time; requests the client pipelined into the same read
//! are answered in order before the socket is read again.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Per-connection bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// How long a connection may sit without sending a byte. A connection
    /// that times out mid-request is answered `408`.
    pub idle_timeout: Duration,
    /// Largest request, head plus declared body, we are willing to buffer.
    pub max_request_size: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_request_size: 8 * 1024 * 1024,
        }
    }
}

/// The client-facing HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function, usually [`Gateway::handle`](crate::gateway::Gateway::handle).
/// Every request carries the client address in [`Request::peer_addr`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cache_entity::server::Server;
/// use cache_entity::http::{Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?
///         .idle_timeout(Duration::from_secs(5));
///     server.run(|_req| async {
///         Response::new(StatusCode::OK).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    limits: ConnectionLimits,
}

impl Server {
    /// Binds the server to the given TCP address with default
    /// [`ConnectionLimits`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            limits: ConnectionLimits::default(),
        })
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.limits.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.limits.max_request_size = bytes;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is shared across all connection tasks, so it must be
    /// `Send + Sync + 'static`. Runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let limits = self.limits;
        info!(
            address = %self.local_addr,
            idle_timeout = ?limits.idle_timeout,
            max_request_size = limits.max_request_size,
            "gateway listening"
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer_addr, limits, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// What the buffered bytes of a connection hold.
#[derive(Debug)]
enum Frame {
    /// A complete request and the number of buffered bytes it spans.
    Ready(Request, usize),
    NeedMore,
    /// An answer to send before closing the connection.
    Reject(Response),
}

fn next_frame(buf: &[u8], peer_addr: SocketAddr, limits: &ConnectionLimits) -> Frame {
    let (request, body_offset) = match Request::parse(buf) {
        Ok(pair) => pair,
        Err(RequestError::Incomplete) if buf.len() > limits.max_request_size => {
            return Frame::Reject(too_large());
        }
        Err(RequestError::Incomplete) => return Frame::NeedMore,
        Err(e) => {
            warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
            return Frame::Reject(
                Response::new(StatusCode::BAD_REQUEST).body(format!("Bad Request: {e}")),
            );
        }
    };

    if request.headers().contains("transfer-encoding") {
        return Frame::Reject(
            Response::new(StatusCode::NOT_IMPLEMENTED)
                .body("Chunked request bodies are not supported"),
        );
    }

    let content_length = match request.headers().get("content-length") {
        None => 0,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => {
                return Frame::Reject(
                    Response::new(StatusCode::BAD_REQUEST).body("Bad Request: invalid Content-Length"),
                );
            }
        },
    };

    // Checked against the declared size so an oversized body is refused
    // before any of it is buffered.
    let total = body_offset.saturating_add(content_length);
    if total > limits.max_request_size {
        warn!(peer = %peer_addr, content_length, "request too large, sending 413");
        return Frame::Reject(too_large());
    }
    if buf.len() < total {
        return Frame::NeedMore;
    }

    Frame::Ready(request.with_peer_addr(peer_addr), total)
}

fn too_large() -> Response {
    Response::new(StatusCode::PAYLOAD_TOO_LARGE).body("Request entity too large")
}

async fn serve_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    limits: ConnectionLimits,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        loop {
            match next_frame(&buf, peer_addr, &limits) {
                Frame::NeedMore => break,
                Frame::Reject(response) => {
                    stream.write_all(&response.keep_alive(false).into_bytes()).await?;
                    return Ok(());
                }
                Frame::Ready(request, consumed) => {
                    let keep_alive = request.is_keep_alive();
                    debug!(
                        peer = %peer_addr,
                        method = %request.method(),
                        target = %request.path_with_query(),
                        "dispatching request"
                    );

                    let response = handler(request).await.keep_alive(keep_alive);
                    stream.write_all(&response.into_bytes()).await?;
                    stream.flush().await?;
                    let _ = buf.split_to(consumed);

                    if !keep_alive {
                        debug!(peer = %peer_addr, "Connection: close, shutting down");
                        return Ok(());
                    }
                }
            }
        }

        match tokio::time::timeout(limits.idle_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!(peer = %peer_addr, "connection closed by peer");
                return Ok(());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) if buf.is_empty() => {
                debug!(peer = %peer_addr, "idle connection timed out");
                return Ok(());
            }
            Err(_) => {
                warn!(peer = %peer_addr, buffered = buf.len(), "request timed out, sending 408");
                let response = Response::new(StatusCode::REQUEST_TIMEOUT)
                    .body("Request Timeout")
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                return Ok(());
            }
        }
    }
}
