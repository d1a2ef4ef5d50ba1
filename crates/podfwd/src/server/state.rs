//! Shared application state injected into every Axum handler.

use std::sync::Arc;
use std::time::Duration;

use forwarder::{ClusterClient, ForwardManager};
use tokio_util::sync::CancellationToken;

/// Application state shared across all request handlers.
///
/// All fields are cheaply cloneable so that Axum can clone the state for each
/// request.
#[derive(Clone)]
pub struct AppState {
    /// Owner of every forward rule.
    pub manager: ForwardManager,
    /// Read-only cluster access for namespace and resource listings.
    pub cluster: Arc<dyn ClusterClient>,
    /// Interval between SSE keep-alive comments.
    pub sse_heartbeat: Duration,
    /// Cancelled when the server begins shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        manager: ForwardManager,
        cluster: Arc<dyn ClusterClient>,
        sse_heartbeat: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            cluster,
            sse_heartbeat,
            shutdown,
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State over an in-memory cluster and echoing channels, with forwards
    /// bound to loopback.
    pub fn with_cluster(cluster: forwarder::testing::StaticCluster) -> Self {
        use std::net::{IpAddr, Ipv4Addr};

        use forwarder::testing::EchoOpener;
        use forwarder::ManagerOptions;

        let cluster: Arc<dyn ClusterClient> = Arc::new(cluster);
        let manager = ForwardManager::new(
            cluster.clone(),
            Arc::new(EchoOpener::default()),
            ManagerOptions {
                bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                shutdown_grace: Duration::from_millis(200),
            },
        );
        Self::new(manager, cluster, Duration::from_secs(15), CancellationToken::new())
    }
}

#[cfg(test)]
impl Default for AppState {
    /// An empty cluster, suitable for tests.
    fn default() -> Self {
        Self::with_cluster(forwarder::testing::StaticCluster::default())
    }
}
