//! `podfwd` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (JSON logs, optional OTLP spans).
//! 3. Build the Kubernetes client and the port-forward channel opener.
//! 4. Create the [`ForwardManager`].
//! 5. Build the Axum router and serve until Ctrl-C / SIGTERM.
//! 6. Stop every forward and drain open connections.

mod config;
mod server;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use forwarder::{ClusterClient, ForwardManager, KubeCluster, KubePortForwarder, ManagerOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;
use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        "podfwd starting"
    );

    // -----------------------------------------------------------------------
    // 3. Cluster access
    // -----------------------------------------------------------------------
    let kube = KubeCluster::connect(cfg.kube_config_path.as_deref())
        .await
        .context("failed to create Kubernetes client")?;
    let opener = KubePortForwarder::new(kube.client());
    let cluster: Arc<dyn ClusterClient> = Arc::new(kube);

    // -----------------------------------------------------------------------
    // 4. Forward manager
    // -----------------------------------------------------------------------
    let manager = ForwardManager::new(
        cluster.clone(),
        Arc::new(opener),
        ManagerOptions {
            bind_addr: cfg.bind_addr()?,
            shutdown_grace: cfg.shutdown_grace(),
        },
    );

    // -----------------------------------------------------------------------
    // 5. HTTP server
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let state = AppState::new(manager.clone(), cluster, cfg.sse_heartbeat(), shutdown.clone());
    let router = server::router::build(state);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("HTTP server failed")?;

    // -----------------------------------------------------------------------
    // 6. Teardown
    // -----------------------------------------------------------------------
    manager.shutdown().await;
    telemetry::shutdown_telemetry();
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM, cancelling `token` so open event streams end.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
    token.cancel();
}
