//! Upstream connector for the API reverse proxy
//!
//! Every forwarded request gets its own HTTP/1.1 connection to the upstream.
//! Request and response bodies are streamed through untouched; only the Host
//! header is rewritten. The connection task is tied to the response body, so a
//! client that goes away tears the upstream connection down with it.

use crate::error::{BoxError, GatewayBody};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::client::conn::http1;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct UpstreamStats {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Merge `overrides` over `inbound`: every overridden name is replaced, all
/// other headers are copied as-is.
pub fn upstream_headers(inbound: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = inbound.clone();
    for name in overrides.keys() {
        merged.remove(name);
        for value in overrides.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

/// Aborts a task when dropped
pub(crate) struct AbortOnDrop(pub(crate) AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Response body that keeps the upstream connection alive only as long as the
/// client is still reading
struct GuardedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    _conn: AbortOnDrop,
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// The fixed upstream the API prefix is forwarded to
pub struct Upstream {
    addr: SocketAddr,
    overrides: HeaderMap,
    stats: Arc<UpstreamStats>,
}

impl Upstream {
    pub fn new(addr: SocketAddr) -> Self {
        let mut overrides = HeaderMap::new();
        overrides.insert(
            HOST,
            HeaderValue::from_str(&addr.to_string()).expect("socket address is a valid header value"),
        );

        Self {
            addr,
            overrides,
            stats: Arc::new(UpstreamStats::default()),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request and hand back the upstream response with its body
    /// still streaming
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<GatewayBody>, UpstreamError> {
        self.stats.record_request();
        let result = self.send(req).await;
        if result.is_err() {
            self.stats.record_failure();
        }
        result
    }

    async fn send(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<GatewayBody>, UpstreamError> {
        let (mut parts, body) = req.into_parts();

        // HTTP/1.1 wants origin-form; HTTP/2 requests arrive in absolute-form
        parts.uri = parts
            .uri
            .path_and_query()
            .cloned()
            .map(Uri::from)
            .unwrap_or_else(|| Uri::from_static("/"));
        parts.version = Version::HTTP_11;
        parts.headers = upstream_headers(&parts.headers, &self.overrides);

        // A request that declares no body is closed right away
        let body = if body.is_end_stream() {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        } else {
            body.boxed()
        };

        let (mut sender, conn) = self.open().await?;
        let response = sender
            .send_request(Request::from_parts(parts, body))
            .await
            .map_err(UpstreamError::Request)?;

        let (parts, body) = response.into_parts();
        let body = GuardedBody {
            inner: body.boxed(),
            _conn: conn,
        };
        Ok(Response::from_parts(
            parts,
            body.map_err(Into::<BoxError>::into).boxed_unsync(),
        ))
    }

    /// One-shot GET used to report upstream readiness at startup
    pub async fn probe(&self, path: &str) -> Result<StatusCode, UpstreamError> {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Empty::<Bytes>::new())
            .map_err(|e| UpstreamError::RequestBuild(e.to_string()))?;
        let merged = upstream_headers(req.headers(), &self.overrides);
        *req.headers_mut() = merged;

        let (mut sender, _conn) = self.open().await?;
        let response = sender.send_request(req).await.map_err(UpstreamError::Request)?;
        Ok(response.status())
    }

    async fn open<B>(&self) -> Result<(http1::SendRequest<B>, AbortOnDrop), UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: self.addr,
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(addr = %self.addr, error = %e, "Failed to set TCP_NODELAY on upstream connection");
        }

        let mut builder = http1::Builder::new();
        builder.preserve_header_case(true);
        let (sender, conn) = builder
            .handshake(TokioIo::new(stream))
            .await
            .map_err(UpstreamError::Handshake)?;

        let addr = self.addr;
        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(%addr, error = %e, "Upstream connection closed with error");
            }
        });

        Ok((sender, AbortOnDrop(task.abort_handle())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    #[test]
    fn test_upstream_headers_overrides_host() {
        let inbound = headers(&[
            ("host", "shop.example.com:3000"),
            ("content-type", "application/json"),
            ("idempotency-key", "order-123"),
        ]);
        let overrides = headers(&[("host", "127.0.0.1:5000")]);

        let merged = upstream_headers(&inbound, &overrides);

        assert_eq!(merged.get(HOST).unwrap(), "127.0.0.1:5000");
        assert_eq!(merged.get_all(HOST).iter().count(), 1);
        assert_eq!(merged.get("content-type").unwrap(), "application/json");
        assert_eq!(merged.get("idempotency-key").unwrap(), "order-123");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_upstream_headers_keeps_repeated_values_and_input() {
        let inbound = headers(&[("cookie", "a=1"), ("cookie", "b=2")]);
        let overrides = headers(&[("host", "127.0.0.1:5000")]);

        let merged = upstream_headers(&inbound, &overrides);

        assert_eq!(merged.get_all("cookie").iter().count(), 2);
        assert!(merged.contains_key(HOST));
        assert!(!inbound.contains_key(HOST));
    }

    #[test]
    fn test_stats() {
        let stats = UpstreamStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();

        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_health_check_rejects_invalid_path() {
        let result = Upstream::new("127.0.0.1:5000".parse().unwrap())
            .probe("not a path")
            .await;
        assert!(matches!(result, Err(UpstreamError::RequestBuild(_))));
    }

    #[test]
    fn test_host_override_uses_upstream_address() {
        let upstream = Upstream::new("127.0.0.1:5000".parse().unwrap());
        assert_eq!(upstream.overrides.get(HOST).unwrap(), "127.0.0.1:5000");
    }

    #[tokio::test]
    async fn test_dropping_guard_aborts_connection_task() {
        let task = tokio::spawn(std::future::pending::<()>());
        let guard = AbortOnDrop(task.abort_handle());

        drop(guard);

        let err = task.await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = Upstream::new(addr).probe("/health").await;
        assert!(matches!(result, Err(UpstreamError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_probe_reports_status_and_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let status = Upstream::new(addr).probe("/health").await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /health HTTP/1.1\r\n"), "{}", request);
        assert!(
            request.to_lowercase().contains(&format!("host: {}", addr)),
            "{}",
            request
        );
    }
}
