use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storefront_gate::assets::SiteRoot;
use storefront_gate::config::GatewayConfig;
use storefront_gate::listener::bind_with_fallback;
use storefront_gate::proxy::{Gateway, GatewayServer};
use storefront_gate::upstream::Upstream;
use storefront_gate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Config file picked up from the working directory when no path is given
const DEFAULT_CONFIG_FILE: &str = "gateway.toml";

/// How long the startup upstream probe may take
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("storefront_gate=debug".parse().expect("valid log directive")),
        )
        .init();

    let mut config = load_config(std::env::args().nth(1).map(PathBuf::from))?;
    config.apply_env().map_err(|e| {
        error!(error = %e, "Invalid environment");
        e
    })?;

    print_startup_banner(&config);

    let site = SiteRoot::resolve(&config.site.candidates).map_err(|e| {
        error!("No build directory found. Looked for:");
        for dir in &config.site.candidates {
            error!(" - {}", dir.display());
        }
        error!("Please build the frontend (e.g., cd frontend && npm ci && npm run build).");
        e
    })?;
    info!(site = %site.path().display(), "Serving site");

    let upstream = Upstream::new(config.proxy.upstream_addr()?);
    spawn_upstream_probe(config.proxy.upstream_addr()?, config.proxy.health_path.clone());

    let bound = bind_with_fallback(config.server.bind_ip()?, &config.server.candidate_ports())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start listener");
            e
        })?;
    info!(
        "Storefront gateway serving {} on http://{}",
        site.path().display(),
        bound.local_addr()
    );

    let gateway = Arc::new(Gateway::new(config.proxy.prefix.clone(), site, upstream));
    let stats = gateway.upstream_stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = GatewayServer::new(bound, gateway, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await;

    // The server drains in-flight connections before it returns
    let _ = shutdown_tx.send(true);
    if let Err(e) = server_handle.await {
        error!(error = %e, "Gateway server task failed");
    }

    info!(
        forwarded = stats.get_total_requests(),
        failed = stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<GatewayConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
        None => {
            info!("No configuration file, using defaults");
            return Ok(GatewayConfig::default());
        }
    };

    let config = GatewayConfig::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Report once whether the API upstream answers its health check. Forwarding
/// never waits on this.
fn spawn_upstream_probe(addr: std::net::SocketAddr, health_path: String) {
    tokio::spawn(async move {
        let upstream = Upstream::new(addr);
        match tokio::time::timeout(PROBE_TIMEOUT, upstream.probe(&health_path)).await {
            Ok(Ok(status)) if status.is_success() => {
                info!(upstream = %addr, path = %health_path, "Upstream is ready");
            }
            Ok(Ok(status)) => {
                warn!(upstream = %addr, path = %health_path, status = status.as_u16(), "Upstream is up but not healthy");
            }
            Ok(Err(e)) => {
                warn!(upstream = %addr, error = %e, "Upstream not reachable yet, API requests will return 502");
            }
            Err(_) => {
                warn!(upstream = %addr, timeout_ms = PROBE_TIMEOUT.as_millis() as u64, "Upstream health probe timed out");
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &GatewayConfig) {
    info!(name = PKG_NAME, version = VERSION, "Starting storefront gateway");
    info!(
        bind = %config.server.bind,
        ports = ?config.server.candidate_ports(),
        "Listener configuration"
    );
    info!(
        prefix = %config.proxy.prefix,
        upstream_host = %config.proxy.upstream_host,
        upstream_port = config.proxy.upstream_port,
        "API proxy configuration"
    );
    info!(
        candidates = ?config.site.candidates,
        "Site build directories"
    );
}
