//! Forwarding requests to the upstream service.
//!
//! [`Upstream`] is the seam the gateway calls once the middleware stack has
//! run; [`HttpUpstream`] is the HTTP/1.1 implementation. Responses are read
//! in full before being handed back, so the response phase always sees a
//! complete body.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::context::Context;
use crate::http::{Headers, Method, Response, ResponseSource, StatusCode};

/// Largest upstream response we are willing to buffer (32 MiB).
const MAX_RESPONSE_SIZE: usize = 32 * 1024 * 1024;

const MAX_HEADERS: usize = 96;

/// Errors produced while talking to the upstream service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream {addr} did not answer within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("malformed upstream response: {0}")]
    Invalid(&'static str),

    #[error("upstream closed the connection before the response was complete")]
    Incomplete,

    #[error("upstream response exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

/// Something that can answer a request on behalf of the gateway.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends the request in `ctx` and returns the complete response, marked
    /// [`ResponseSource::Service`].
    async fn send(&self, ctx: &Context) -> Result<Response, UpstreamError>;
}

/// HTTP/1.1 upstream reached over plain TCP.
///
/// One connection per request with `Connection: close`; the `Host` header is
/// rewritten to the upstream address, the client address is appended to
/// `X-Forwarded-For`, and the context's header overrides are applied on top
/// of the inbound headers.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    addr: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// `addr` is a `host:port` pair.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Bounds the whole round-trip, connect included.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn round_trip(&self, ctx: &Context) -> Result<Response, UpstreamError> {
        let mut stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| UpstreamError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;

        stream.write_all(&encode_request(ctx, &self.addr)).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            if stream.read_buf(&mut buf).await? == 0 {
                break;
            }
            if buf.len() > MAX_RESPONSE_SIZE {
                return Err(UpstreamError::TooLarge {
                    max_bytes: MAX_RESPONSE_SIZE,
                });
            }
        }

        let head_only = ctx.method() == &Method::Head;
        parse_response(&buf, head_only)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, ctx: &Context) -> Result<Response, UpstreamError> {
        debug!(
            upstream = %self.addr,
            method = %ctx.method(),
            target = %ctx.path_with_query(),
            buffered = ctx.is_buffered(),
            "forwarding request"
        );

        match tokio::time::timeout(self.timeout, self.round_trip(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                addr: self.addr.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Serializes the request in `ctx` for the upstream at `authority`.
fn encode_request(ctx: &Context, authority: &str) -> BytesMut {
    let request = ctx.request();
    let overrides = ctx.upstream_headers();
    let body = request.body();

    let mut headers = request.headers().clone();
    headers.strip_hop_by_hop();
    headers.remove("host");
    if let Some(peer) = request.peer_addr() {
        let chain = match headers.get("x-forwarded-for") {
            Some(prior) => format!("{prior}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        headers.set("X-Forwarded-For", chain);
    }
    for (name, _) in overrides.iter() {
        headers.remove(name);
    }

    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put(format!("{} {} HTTP/1.1\r\n", request.method(), request.path_with_query()).as_bytes());
    buf.put(format!("Host: {authority}\r\n").as_bytes());
    for (name, value) in headers.iter().chain(overrides.iter()) {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put(&b"Connection: close\r\n"[..]);
    if !body.is_empty() || request.content_length().is_some() {
        buf.put(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.put(&b"\r\n"[..]);
    buf.put(body.as_ref());
    buf
}

/// Parses a complete, buffered HTTP/1.x response read up to connection close.
fn parse_response(buf: &[u8], head_only: bool) -> Result<Response, UpstreamError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut raw_headers);

    let body_offset = match raw.parse(buf)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Err(UpstreamError::Incomplete),
    };

    let status = raw
        .code
        .and_then(StatusCode::from_u16)
        .ok_or(UpstreamError::Invalid("missing status code"))?;

    let mut headers = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            headers.insert(header.name, value);
        }
    }

    let rest = &buf[body_offset..];
    let body = if head_only || status.is_bodiless() {
        Bytes::new()
    } else if headers
        .get("transfer-encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    {
        decode_chunked(rest)?
    } else if let Some(len) = headers.get("content-length") {
        let len: usize = len
            .trim()
            .parse()
            .map_err(|_| UpstreamError::Invalid("bad content-length"))?;
        if rest.len() < len {
            return Err(UpstreamError::Incomplete);
        }
        Bytes::copy_from_slice(&rest[..len])
    } else {
        Bytes::copy_from_slice(rest)
    };

    headers.strip_hop_by_hop();

    Ok(Response::new(status)
        .with_headers(headers)
        .body_bytes(body)
        .with_source(ResponseSource::Service))
}

/// Decodes a `Transfer-Encoding: chunked` body. Trailers are discarded.
fn decode_chunked(mut rest: &[u8]) -> Result<Bytes, UpstreamError> {
    let mut body = BytesMut::new();
    loop {
        let (consumed, size) = match httparse::parse_chunk_size(rest)
            .map_err(|_| UpstreamError::Invalid("bad chunk size"))?
        {
            httparse::Status::Complete(pair) => pair,
            httparse::Status::Partial => return Err(UpstreamError::Incomplete),
        };
        rest = &rest[consumed..];

        if size == 0 {
            return Ok(body.freeze());
        }

        let size = match usize::try_from(size) {
            Ok(size) if size <= MAX_RESPONSE_SIZE - body.len() => size,
            _ => {
                return Err(UpstreamError::TooLarge {
                    max_bytes: MAX_RESPONSE_SIZE,
                });
            }
        };
        if rest.len() < size + 2 {
            return Err(UpstreamError::Incomplete);
        }
        body.put(&rest[..size]);
        if &rest[size..size + 2] != b"\r\n" {
            return Err(UpstreamError::Invalid("chunk not terminated by CRLF"));
        }
        rest = &rest[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use tokio::net::TcpListener;

    #[test]
    fn encodes_overrides_and_host() {
        let request = Request::new(Method::Get, "/products?id=5")
            .header("Host", "gateway.local")
            .header("Cache-Control", "max-age=0")
            .header("Accept", "application/json");
        let mut ctx = Context::new(request);
        ctx.set_upstream_header("Cache-Control", "no-cache");

        let raw = encode_request(&ctx, "127.0.0.1:9000");
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.starts_with("GET /products?id=5 HTTP/1.1\r\nHost: 127.0.0.1:9000\r\n"));
        assert!(text.contains("Accept: application/json\r\n"));
        assert!(text.contains("Cache-Control: no-cache\r\n"));
        assert!(!text.contains("max-age=0"));
        assert!(!text.contains("gateway.local"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn appends_client_to_forwarded_for() {
        let peer: std::net::SocketAddr = "192.0.2.10:40000".parse().unwrap();

        let request = Request::new(Method::Get, "/").with_peer_addr(peer);
        let raw = encode_request(&Context::new(request), "up:80");
        assert!(std::str::from_utf8(&raw).unwrap().contains("X-Forwarded-For: 192.0.2.10\r\n"));

        let request = Request::new(Method::Get, "/")
            .header("X-Forwarded-For", "203.0.113.5")
            .with_peer_addr(peer);
        let raw = encode_request(&Context::new(request), "up:80");
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains("X-Forwarded-For: 203.0.113.5, 192.0.2.10\r\n"));
        assert_eq!(text.matches("X-Forwarded-For").count(), 1);
    }

    #[test]
    fn encodes_body_with_length() {
        let request = Request::new(Method::Post, "/orders").with_body("{\"n\":1}");
        let raw = encode_request(&Context::new(request), "up:80");
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"n\":1}"));
    }

    #[test]
    fn parses_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 8\r\nx-cache-tags: cache:products\r\n\r\n{\"id\":5}";
        let response = parse_response(raw, false).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content().as_ref(), b"{\"id\":5}");
        assert_eq!(response.headers().get("x-cache-tags"), Some("cache:products"));
        assert!(!response.headers().contains("content-length"));
        assert_eq!(response.source(), ResponseSource::Service);
    }

    #[test]
    fn parses_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: x\r\n\r\n";
        let response = parse_response(raw, false).unwrap();
        assert_eq!(response.content().as_ref(), b"Wikipedia");
        assert!(!response.headers().contains("transfer-encoding"));
    }

    #[test]
    fn reads_to_close_without_framing() {
        let raw = b"HTTP/1.0 200 OK\r\n\r\nuntil the end";
        let response = parse_response(raw, false).unwrap();
        assert_eq!(response.content().as_ref(), b"until the end");
    }

    #[test]
    fn unusual_status_codes_survive() {
        let raw = b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 0\r\n\r\n";
        let response = parse_response(raw, false).unwrap();
        assert_eq!(response.status().as_u16(), 418);
    }

    #[test]
    fn head_and_bodiless_statuses_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        assert!(parse_response(raw, true).unwrap().content().is_empty());
        let raw = b"HTTP/1.1 304 Not Modified\r\n\r\n";
        assert!(parse_response(raw, false).unwrap().content().is_empty());
    }

    #[test]
    fn truncated_responses_are_rejected() {
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Le", false),
            Err(UpstreamError::Incomplete)
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort", false),
            Err(UpstreamError::Incomplete)
        ));
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nab", false),
            Err(UpstreamError::Incomplete)
        ));
    }

    #[test]
    fn oversized_chunk_size_is_rejected() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab\r\n0\r\n\r\n";
        assert!(matches!(
            parse_response(raw, false),
            Err(UpstreamError::TooLarge { .. })
        ));

        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2000001\r\nab\r\n0\r\n\r\n";
        assert!(matches!(
            parse_response(raw, false),
            Err(UpstreamError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            while !buf.ends_with(b"\r\n\r\n") {
                socket.read_buf(&mut buf).await.unwrap();
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi")
                .await
                .unwrap();
            String::from_utf8(buf.to_vec()).unwrap()
        });

        let mut ctx = Context::new(Request::new(Method::Get, "/greeting"));
        ctx.set_upstream_header("Cache-Control", "no-cache");
        let response = HttpUpstream::new(addr).send(&ctx).await.unwrap();
        assert_eq!(response.content().as_ref(), b"hi");

        let seen = server.await.unwrap();
        assert!(seen.starts_with("GET /greeting HTTP/1.1\r\n"));
        assert!(seen.contains("Cache-Control: no-cache\r\n"));
    }

    #[tokio::test]
    async fn refused_connection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let ctx = Context::new(Request::new(Method::Get, "/"));
        let err = HttpUpstream::new(addr).send(&ctx).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect { .. }));
    }
}
