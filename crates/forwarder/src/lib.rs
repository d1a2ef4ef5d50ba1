//! Local TCP listeners relayed to ports of Kubernetes pods and services.
//!
//! [`ForwardManager`] owns every forward rule. Each rule binds one local port
//! and opens a fresh remote channel per accepted client; rule changes are
//! published as [`common::ForwardEvent`]s to subscribers.

pub mod channel;
pub mod cluster;
pub mod error;
pub mod events;
pub mod manager;
mod proxy;
pub mod registry;
pub mod resolver;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::{ChannelOpener, KubePortForwarder, RemoteChannel};
pub use cluster::{ClusterClient, ClusterError, KubeCluster, PodSummary, ServiceSummary};
pub use error::ForwardError;
pub use events::{ObserverError, Subscription};
pub use manager::{ForwardManager, ManagerOptions};
pub use resolver::{ResolveError, TargetResolver};
