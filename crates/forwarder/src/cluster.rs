//! Cluster API access: namespace/pod/service listing and service selectors.
//!
//! The forward manager only depends on the [`ClusterClient`] trait; the
//! production implementation, [`KubeCluster`], talks to the Kubernetes API via
//! `kube`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use common::protocol::ResourcePort;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use thiserror::Error;
use tracing::debug;

/// Errors from the cluster API layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The kubeconfig could not be read or produced no usable client.
    #[error("failed to load cluster configuration: {0}")]
    Config(String),

    /// An API request failed.
    #[error("cluster request failed: {0}")]
    Request(String),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        ClusterError::Request(e.to_string())
    }
}

/// The parts of a pod the forwarder cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    /// Pod phase as reported by the API (`Pending`, `Running`, ...).
    pub phase: Option<String>,
    /// Declared container ports.
    pub ports: Vec<ResourcePort>,
}

impl PodSummary {
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some("Running")
    }
}

/// The parts of a service the forwarder cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub name: String,
    pub ports: Vec<ResourcePort>,
}

/// Read-only view of the cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Names of all namespaces, in API order.
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    /// Pods in `namespace`, optionally filtered by a `k=v,...` label selector.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<PodSummary>, ClusterError>;

    /// Services in `namespace`.
    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceSummary>, ClusterError>;

    /// Pod selector of service `name`; empty when the service has none.
    async fn service_selector(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError>;
}

/// [`ClusterClient`] backed by a `kube` client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig path, or from the default
    /// chain (`KUBECONFIG`, `~/.kube/config`, in-cluster service account).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] if no usable configuration is found.
    pub async fn connect(kubeconfig_path: Option<&str>) -> Result<Self, ClusterError> {
        let client = match kubeconfig_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Config(format!("{path}: {e}")))?;
                let config =
                    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ClusterError::Config(format!("{path}: {e}")))?;
                Client::try_from(config).map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };
        Ok(Self::new(client))
    }

    /// The underlying client, shared with the port-forward channel opener.
    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().filter_map(|ns| ns.metadata.name).collect())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector.as_deref() {
            params = params.labels(selector);
        }
        let list = api.list(&params).await?;
        debug!(namespace, count = list.items.len(), "listed pods");

        Ok(list
            .items
            .into_iter()
            .filter_map(|pod| {
                let name = pod.metadata.name?;
                let phase = pod.status.and_then(|s| s.phase);
                let ports = pod
                    .spec
                    .map(|spec| {
                        spec.containers
                            .into_iter()
                            .flat_map(|c| c.ports.unwrap_or_default())
                            .filter_map(|p| {
                                Some(ResourcePort {
                                    port: u16::try_from(p.container_port).ok()?,
                                    name: p.name,
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(PodSummary { name, phase, ports })
            })
            .collect())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<ServiceSummary>, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|svc| {
                let name = svc.metadata.name?;
                let ports = svc
                    .spec
                    .and_then(|spec| spec.ports)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| {
                        Some(ResourcePort {
                            port: u16::try_from(p.port).ok()?,
                            name: p.name,
                        })
                    })
                    .collect();
                Some(ServiceSummary { name, ports })
            })
            .collect())
    }

    async fn service_selector(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = api.get(name).await?;
        Ok(svc.spec.and_then(|spec| spec.selector).unwrap_or_default())
    }
}
