//! In-memory cluster and channel fakes for tests.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::protocol::ResourcePort;
use common::ForwardEvent;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::channel::{ChannelError, ChannelOpener, RemoteChannel};
use crate::cluster::{ClusterClient, ClusterError, PodSummary, ServiceSummary};
use crate::events::ObserverError;

type Labels = BTreeMap<String, String>;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A fixed cluster with one namespace's worth of pods and services.
#[derive(Default, Clone)]
pub struct StaticCluster {
    namespaces: Vec<String>,
    pods: Vec<(PodSummary, Labels)>,
    services: Vec<(ServiceSummary, Labels)>,
    failing: bool,
}

impl StaticCluster {
    /// A cluster whose every request fails.
    pub fn unreachable() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, name: &str) -> Self {
        self.namespaces.push(name.to_owned());
        self
    }

    pub fn with_pod(self, name: &str, phase: &str, pod_labels: &[(&str, &str)]) -> Self {
        self.with_pod_ports(name, phase, pod_labels, &[])
    }

    pub fn with_pod_ports(
        mut self,
        name: &str,
        phase: &str,
        pod_labels: &[(&str, &str)],
        ports: &[u16],
    ) -> Self {
        let pod = PodSummary {
            name: name.to_owned(),
            phase: Some(phase.to_owned()),
            ports: ports.iter().map(|&port| ResourcePort { port, name: None }).collect(),
        };
        self.pods.push((pod, labels(pod_labels)));
        self
    }

    pub fn with_service(self, name: &str, selector: &[(&str, &str)]) -> Self {
        self.with_service_ports(name, selector, &[])
    }

    pub fn with_service_ports(mut self, name: &str, selector: &[(&str, &str)], ports: &[u16]) -> Self {
        let svc = ServiceSummary {
            name: name.to_owned(),
            ports: ports.iter().map(|&port| ResourcePort { port, name: None }).collect(),
        };
        self.services.push((svc, labels(selector)));
        self
    }

    fn check(&self) -> Result<(), ClusterError> {
        if self.failing {
            return Err(ClusterError::Request("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for StaticCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError> {
        self.check()?;
        Ok(self.namespaces.clone())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: Option<String>,
    ) -> Result<Vec<PodSummary>, ClusterError> {
        self.check()?;
        let wanted: Vec<(String, String)> = label_selector
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Ok(self
            .pods
            .iter()
            .filter(|(_, pod_labels)| wanted.iter().all(|(k, v)| pod_labels.get(k) == Some(v)))
            .map(|(pod, _)| pod.clone())
            .collect())
    }

    async fn list_services(&self, _namespace: &str) -> Result<Vec<ServiceSummary>, ClusterError> {
        self.check()?;
        Ok(self.services.iter().map(|(svc, _)| svc.clone()).collect())
    }

    async fn service_selector(&self, _namespace: &str, name: &str) -> Result<Labels, ClusterError> {
        self.check()?;
        self.services
            .iter()
            .find(|(svc, _)| svc.name == name)
            .map(|(_, selector)| selector.clone())
            .ok_or_else(|| ClusterError::Request(format!("services \"{name}\" not found")))
    }
}

/// Opens channels whose far end echoes everything back.
#[derive(Default)]
pub struct EchoOpener {
    diagnostic: Option<String>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
    last_pod: Mutex<Option<String>>,
}

impl EchoOpener {
    /// Every channel also reports `message` on its diagnostic stream.
    pub fn with_diagnostic(message: &str) -> Self {
        Self {
            diagnostic: Some(message.to_owned()),
            ..Self::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn last_pod(&self) -> Option<String> {
        self.last_pod.lock().clone()
    }
}

#[async_trait]
impl ChannelOpener for EchoOpener {
    async fn open(&self, _namespace: &str, pod: &str, _port: u16) -> Result<RemoteChannel, ChannelError> {
        *self.last_pod.lock() = Some(pod.to_owned());

        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });

        let diagnostics = match &self.diagnostic {
            Some(message) => stream::once(futures::future::ready(Bytes::from(message.clone()))).boxed(),
            None => stream::empty().boxed(),
        };

        self.opened.fetch_add(1, Ordering::SeqCst);
        let closed = self.closed.clone();
        Ok(RemoteChannel::new(near, diagnostics, move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Opens channels to a port nothing listens on: the data stream ends at once
/// and `message` arrives on the diagnostic stream just after.
pub struct RefusedOpener {
    message: String,
}

impl RefusedOpener {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

#[async_trait]
impl ChannelOpener for RefusedOpener {
    async fn open(&self, _namespace: &str, _pod: &str, _port: u16) -> Result<RemoteChannel, ChannelError> {
        let (near, far) = tokio::io::duplex(1024);
        drop(far);

        let message = self.message.clone();
        let diagnostics = stream::once(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Bytes::from(message)
        })
        .boxed();
        Ok(RemoteChannel::new(near, diagnostics, || {}))
    }
}

/// Fails every open as if the pod did not exist.
pub struct FailingOpener;

#[async_trait]
impl ChannelOpener for FailingOpener {
    async fn open(&self, _namespace: &str, pod: &str, port: u16) -> Result<RemoteChannel, ChannelError> {
        Err(ChannelError::Open {
            pod: pod.to_owned(),
            port,
            message: format!("pods \"{pod}\" not found"),
        })
    }
}

/// Records every event an observer sees.
#[derive(Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ForwardEvent>>>,
}

impl EventLog {
    pub fn observer(&self) -> impl Fn(&ForwardEvent) -> Result<(), ObserverError> + Send + Sync + 'static {
        let events = self.events.clone();
        move |event| {
            events.lock().push(event.clone());
            Ok(())
        }
    }

    /// Drain what has been recorded so far.
    pub fn take(&self) -> Vec<ForwardEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap_or_else(|e| panic!("no free port: {e}"))
}

/// Poll `cond` until it holds; panics after five seconds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
