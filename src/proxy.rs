use crate::assets::SiteRoot;
use crate::error::{json_error_response, GatewayBody, GatewayErrorCode};
use crate::listener::BoundListener;
use crate::upstream::{AbortOnDrop, Upstream, UpstreamError, UpstreamStats};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// How long in-flight connections may run on after shutdown is requested
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether `path` falls under `prefix` on a segment boundary.
///
/// `/api` matches `/api` and `/api/products` but not `/apiary`.
pub fn matches_prefix(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Per-request routing state, built once at startup
pub struct Gateway {
    prefix: String,
    site: SiteRoot,
    upstream: Arc<Upstream>,
}

impl Gateway {
    pub fn new(prefix: impl Into<String>, site: SiteRoot, upstream: Upstream) -> Self {
        Self {
            prefix: prefix.into(),
            site,
            upstream: Arc::new(upstream),
        }
    }

    pub fn site(&self) -> &SiteRoot {
        &self.site
    }

    pub fn upstream_stats(&self) -> Arc<UpstreamStats> {
        self.upstream.stats()
    }

    pub fn is_api_path(&self, path: &str) -> bool {
        matches_prefix(&self.prefix, path)
    }

    async fn proxy(&self, req: Request<Incoming>, client_addr: SocketAddr) -> Response<GatewayBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        debug!(client = %client_addr, method = %req.method(), uri = %req.uri(), request_id, "Proxying request");

        // A panic while forwarding stays inside this task
        let upstream = Arc::clone(&self.upstream);
        let task = tokio::spawn(async move { upstream.forward(req).await });
        let _forward = AbortOnDrop(task.abort_handle());

        proxy_response(task.await, &request_id, self.upstream.addr())
    }
}

/// Turn the outcome of a forwarding task into the response the client gets
fn proxy_response(
    outcome: Result<Result<Response<GatewayBody>, UpstreamError>, JoinError>,
    request_id: &str,
    upstream: SocketAddr,
) -> Response<GatewayBody> {
    match outcome {
        Ok(Ok(response)) => {
            debug!(request_id, status = response.status().as_u16(), "Upstream responded");
            response
        }
        Ok(Err(e)) => {
            warn!(request_id, %upstream, error = %e, "Upstream request failed");
            json_error_response(GatewayErrorCode::ConnectionFailed, "Upstream unavailable")
        }
        Err(e) => {
            error!(request_id, %upstream, error = %e, "Proxy task failed");
            json_error_response(GatewayErrorCode::InternalError, "Internal gateway error")
        }
    }
}

/// The storefront front door: SPA assets plus the same-origin API proxy
pub struct GatewayServer {
    bound: BoundListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bound: BoundListener, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bound,
            gateway,
            shutdown_rx,
        }
    }

    /// Accept connections until shutdown is requested, then give in-flight
    /// connections up to [`DRAIN_TIMEOUT`] to finish
    pub async fn run(self) -> anyhow::Result<()> {
        let GatewayServer {
            bound,
            gateway,
            mut shutdown_rx,
        } = self;
        let local_addr = bound.local_addr();
        let listener = bound.into_inner();

        info!(
            addr = %local_addr,
            site = %gateway.site().path().display(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&gateway);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let gateway = Arc::clone(&gateway);
                                async move { handle_request(req, gateway, addr).await }
                            });
                            let conn = builder
                                .serve_connection(TokioIo::new(stream), service)
                                .into_owned();
                            let conn = graceful.watch(conn);
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections closed");
            }
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Timed out waiting for connections to close");
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    if gateway.is_api_path(req.uri().path()) {
        return Ok(gateway.proxy(req, client_addr).await);
    }

    debug!(method = %req.method(), path = req.uri().path(), "Serving site request");
    Ok(gateway.site.serve(req).await)
}
