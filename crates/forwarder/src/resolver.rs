//! Resolves a forward target (pod or service) to the pod a channel is opened to.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::ResourceKind;
use thiserror::Error;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterError};

/// Errors from target resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Service \"{service}\" has no pod selector")]
    NoSelector { service: String },

    #[error("No running pods found for service \"{service}\"")]
    NoRunningPods { service: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Turns `(namespace, kind, name)` into a concrete pod name.
#[derive(Clone)]
pub struct TargetResolver {
    cluster: Arc<dyn ClusterClient>,
}

impl TargetResolver {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Resolve a target to a pod name.
    ///
    /// Pods resolve to themselves without any API call; whether the pod exists
    /// is left to the channel opener. Services resolve to the first `Running`
    /// pod matching their selector.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NoSelector`] for selector-less services,
    /// [`ResolveError::NoRunningPods`] when nothing matching is running, and
    /// [`ResolveError::Cluster`] when the API calls fail.
    pub async fn resolve(
        &self,
        namespace: &str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<String, ResolveError> {
        if kind == ResourceKind::Pod {
            return Ok(name.to_owned());
        }

        let selector = self.cluster.service_selector(namespace, name).await?;
        if selector.is_empty() {
            return Err(ResolveError::NoSelector {
                service: name.to_owned(),
            });
        }

        let label_selector = label_selector(&selector);
        let pods = self
            .cluster
            .list_pods(namespace, Some(label_selector.clone()))
            .await?;

        let pod = pods
            .into_iter()
            .find(|p| p.is_running())
            .ok_or_else(|| ResolveError::NoRunningPods {
                service: name.to_owned(),
            })?;

        debug!(namespace, service = name, selector = %label_selector, pod = %pod.name, "resolved service");
        Ok(pod.name)
    }
}

/// Render a selector map as `k1=v1,k2=v2`.
fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockClusterClient, PodSummary};

    fn pod(name: &str, phase: &str) -> PodSummary {
        PodSummary {
            name: name.into(),
            phase: Some(phase.into()),
            ports: vec![],
        }
    }

    fn selector(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn label_selector_joins_sorted_pairs() {
        let s = selector(&[("tier", "web"), ("app", "shop")]);
        assert_eq!(label_selector(&s), "app=shop,tier=web");
    }

    #[tokio::test]
    async fn pod_targets_need_no_api_calls() {
        let cluster = MockClusterClient::new();
        let resolver = TargetResolver::new(Arc::new(cluster));
        let pod = resolver
            .resolve("default", ResourceKind::Pod, "web-1")
            .await
            .unwrap();
        assert_eq!(pod, "web-1");
    }

    #[tokio::test]
    async fn service_resolves_to_first_running_pod() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_service_selector()
            .withf(|ns, name| ns == "default" && name == "api")
            .returning(|_, _| Ok(selector(&[("app", "api")])));
        cluster
            .expect_list_pods()
            .withf(|ns, sel| ns == "default" && sel.as_deref() == Some("app=api"))
            .returning(|_, _| {
                Ok(vec![
                    pod("api-0", "Pending"),
                    pod("api-1", "Running"),
                    pod("api-2", "Running"),
                ])
            });

        let resolver = TargetResolver::new(Arc::new(cluster));
        let pod = resolver
            .resolve("default", ResourceKind::Service, "api")
            .await
            .unwrap();
        assert_eq!(pod, "api-1");
    }

    #[tokio::test]
    async fn service_without_selector_fails() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_service_selector()
            .returning(|_, _| Ok(BTreeMap::new()));
        cluster.expect_list_pods().never();

        let resolver = TargetResolver::new(Arc::new(cluster));
        let err = resolver
            .resolve("default", ResourceKind::Service, "headless")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoSelector { ref service } if service == "headless"));
    }

    #[tokio::test]
    async fn service_without_running_pods_fails() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_service_selector()
            .returning(|_, _| Ok(selector(&[("app", "api")])));
        cluster
            .expect_list_pods()
            .returning(|_, _| Ok(vec![pod("api-0", "Pending"), pod("api-1", "Failed")]));

        let resolver = TargetResolver::new(Arc::new(cluster));
        let err = resolver
            .resolve("default", ResourceKind::Service, "api")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), r#"No running pods found for service "api""#);
    }

    #[tokio::test]
    async fn api_failures_propagate() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_service_selector()
            .returning(|_, _| Err(ClusterError::Request("services \"api\" not found".into())));

        let resolver = TargetResolver::new(Arc::new(cluster));
        let err = resolver
            .resolve("default", ResourceKind::Service, "api")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Cluster(_)));
    }
}
