//! Remote channels: one byte pipe per client connection into a pod port.
//!
//! A [`RemoteChannel`] bundles the data substream, the diagnostic substream
//! (error text reported by the control plane, e.g. "connection refused") and a
//! close operation. Channels are never shared between client connections.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Errors from opening or using a remote channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to open channel to {pod}:{port}: {message}")]
    Open {
        pod: String,
        port: u16,
        message: String,
    },
}

/// Byte stream carrying the forwarded payload.
pub trait DataStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DataStream for T {}

/// Chunks of diagnostic bytes reported for the forwarded port.
pub type Diagnostics = BoxStream<'static, Bytes>;

type Closer = Box<dyn FnOnce() + Send>;

/// An open channel to one port of one pod. Dropping it closes the channel.
pub struct RemoteChannel {
    data: Box<dyn DataStream>,
    diagnostics: Diagnostics,
    guard: ChannelGuard,
}

impl RemoteChannel {
    /// Assemble a channel. `close` runs at most once: on [`Self::close`] or on drop.
    pub fn new<S, F>(data: S, diagnostics: Diagnostics, close: F) -> Self
    where
        S: DataStream + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            data: Box::new(data),
            diagnostics,
            guard: ChannelGuard {
                closer: Some(Box::new(close)),
            },
        }
    }

    /// Split into the data stream, the diagnostics and a guard that closes the
    /// channel when dropped.
    pub fn into_parts(self) -> (Box<dyn DataStream>, Diagnostics, ChannelGuard) {
        (self.data, self.diagnostics, self.guard)
    }
}

impl fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("open", &self.guard.closer.is_some())
            .finish()
    }
}

/// Closes a channel exactly once, explicitly or on drop.
pub struct ChannelGuard {
    closer: Option<Closer>,
}

impl ChannelGuard {
    /// Close the channel. Idempotent.
    pub fn close(&mut self) {
        if let Some(close) = self.closer.take() {
            close();
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens remote channels.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a channel to `port` on `pod` in `namespace`.
    async fn open(&self, namespace: &str, pod: &str, port: u16)
        -> Result<RemoteChannel, ChannelError>;
}

/// [`ChannelOpener`] using the Kubernetes port-forward subresource.
#[derive(Clone)]
pub struct KubePortForwarder {
    client: Client,
}

impl KubePortForwarder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChannelOpener for KubePortForwarder {
    async fn open(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<RemoteChannel, ChannelError> {
        let open_error = |message: String| ChannelError::Open {
            pod: pod.to_owned(),
            port,
            message,
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut forwarder = pods
            .portforward(pod, &[port])
            .await
            .map_err(|e| open_error(e.to_string()))?;

        let data = forwarder
            .take_stream(port)
            .ok_or_else(|| open_error("data stream unavailable".into()))?;

        let diagnostics = match forwarder.take_error(port) {
            Some(error) => stream::once(error)
                .filter_map(|message| future::ready(message.map(Bytes::from)))
                .boxed(),
            None => stream::empty().boxed(),
        };

        debug!(namespace, pod, port, "port-forward channel opened");
        Ok(RemoteChannel::new(data, diagnostics, move || {
            forwarder.abort();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_channel() -> (RemoteChannel, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let (near, _far) = tokio::io::duplex(64);
        let channel = RemoteChannel::new(near, stream::empty().boxed(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (channel, closes)
    }

    #[test]
    fn close_runs_once() {
        let (channel, closes) = counted_channel();
        let (_data, _diagnostics, mut guard) = channel.into_parts();
        guard.close();
        guard.close();
        drop(guard);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_closes() {
        let (channel, closes) = counted_channel();
        drop(channel);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn split_guard_owns_close() {
        let (channel, closes) = counted_channel();
        let (data, diagnostics, guard) = channel.into_parts();
        drop((data, diagnostics));
        assert_eq!(closes.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
