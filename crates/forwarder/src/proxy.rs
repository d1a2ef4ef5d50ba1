//! Per-connection relay between a local TCP client and a remote channel.
//!
//! For each accepted client the proxy:
//! 1. Resolves the target to a pod (services are re-resolved per connection).
//! 2. Opens a fresh remote channel to that pod's port.
//! 3. Relays bytes in both directions until either side finishes.
//!
//! Diagnostic text reported by the channel is logged on the rule and written
//! through to the client. Failures before the relay starts are logged and the
//! client is closed; the rule itself stays `running`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::ResourceKind;
use futures::StreamExt;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{ChannelOpener, Diagnostics, RemoteChannel};
use crate::error::ForwardError;
use crate::manager::RuleHandle;
use crate::resolver::TargetResolver;

/// Longest diagnostic excerpt recorded in a rule's log.
pub(crate) const DIAGNOSTIC_EXCERPT_CHARS: usize = 300;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// How long diagnostics may trail the end of the data stream.
const DIAGNOSTIC_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Where a rule's connections go.
#[derive(Debug, Clone)]
pub(crate) struct ForwardTarget {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    pub remote_port: u16,
}

/// Resolution and channel opening, shared by every rule.
pub(crate) struct Connector {
    pub resolver: TargetResolver,
    pub opener: Arc<dyn ChannelOpener>,
}

impl Connector {
    async fn connect(&self, target: &ForwardTarget, rule: &RuleHandle) -> Result<RemoteChannel, ForwardError> {
        let pod = self
            .resolver
            .resolve(&target.namespace, target.kind, &target.name)
            .await?;
        rule.log(&format!("Connection → {pod}:{}", target.remote_port));
        let channel = self
            .opener
            .open(&target.namespace, &pod, target.remote_port)
            .await?;
        Ok(channel)
    }
}

/// Counts one open client connection on its rule for as long as it lives.
pub(crate) struct ConnectionGuard {
    rule: RuleHandle,
}

impl ConnectionGuard {
    /// Count a connection on `rule`; `None` once the rule has been stopped.
    pub fn open(rule: RuleHandle) -> Option<Self> {
        rule.connection_opened().then(|| Self { rule })
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.rule.connection_closed();
    }
}

/// One accepted client connection.
pub(crate) struct ClientConnection {
    pub guard: ConnectionGuard,
    pub rule: RuleHandle,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Serve one client until it or the remote side closes, or `shutdown` fires.
pub(crate) async fn serve(
    conn: ClientConnection,
    target: ForwardTarget,
    connector: Arc<Connector>,
    shutdown: CancellationToken,
) {
    // The guard is bound first so it is dropped last, after the socket.
    let ClientConnection {
        guard,
        rule,
        stream,
        peer,
    } = conn;

    let connected = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        res = connector.connect(&target, &rule) => res,
    };

    let channel = match connected {
        Ok(channel) => channel,
        Err(e) => {
            warn!(rule_id = %rule.id(), %peer, error = %e, "connection setup failed");
            rule.log(&format!("Error: {e}"));
            return;
        }
    };

    debug!(rule_id = %rule.id(), %peer, "relaying");
    relay(stream, channel, &rule, &shutdown).await;
    debug!(rule_id = %rule.id(), %peer, "connection closed");
    drop(guard);
}

/// Relay between `client` and `channel`. Either side finishing ends both.
async fn relay(client: TcpStream, channel: RemoteChannel, rule: &RuleHandle, shutdown: &CancellationToken) {
    let (data, mut diagnostics, mut channel_guard) = channel.into_parts();
    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = io::split(data);

    let outcome = tokio::select! {
        res = copy_half(&mut client_read, &mut remote_write, "client→pod") => res,
        res = copy_downstream(&mut remote_read, &mut diagnostics, &mut client_write, rule) => res,
        _ = shutdown.cancelled() => Ok(()),
    };

    if let Err(e) = outcome {
        debug!(rule_id = %rule.id(), error = %e, "relay error");
        rule.log(&format!("Error: {e}"));
    }

    channel_guard.close();
    let _ = client_write.shutdown().await;
}

/// Copy bytes from `reader` to `writer`, logging the direction on completion.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W, label: &'static str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = io::copy(reader, writer).await?;
    debug!(label, bytes, "half-close");
    Ok(())
}

/// Copy remote data to the client, interleaving diagnostic chunks.
async fn copy_downstream<R, W>(
    remote: &mut R,
    diagnostics: &mut Diagnostics,
    client: &mut W,
    rule: &RuleHandle,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;
    let mut diagnostics_open = true;

    loop {
        tokio::select! {
            biased;
            chunk = diagnostics.next(), if diagnostics_open => match chunk {
                Some(chunk) => write_diagnostic(&chunk, client, rule).await?,
                None => diagnostics_open = false,
            },
            read = remote.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    debug!(label = "pod→client", bytes, "half-close");
                    // A refused port closes the data stream and reports why
                    // at about the same moment.
                    if diagnostics_open {
                        drain_diagnostics(diagnostics, client, rule).await?;
                    }
                    return Ok(());
                }
                client.write_all(&buf[..n]).await?;
                bytes += n as u64;
            }
        }
    }
}

/// Deliver diagnostics that arrive shortly after the data stream ended.
async fn drain_diagnostics<W>(diagnostics: &mut Diagnostics, client: &mut W, rule: &RuleHandle) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(Some(chunk)) = tokio::time::timeout(DIAGNOSTIC_DRAIN_TIMEOUT, diagnostics.next()).await {
        write_diagnostic(&chunk, client, rule).await?;
    }
    Ok(())
}

/// Log a diagnostic chunk on the rule and pass it through to the client.
async fn write_diagnostic<W>(chunk: &[u8], client: &mut W, rule: &RuleHandle) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(excerpt) = diagnostic_excerpt(chunk) {
        rule.log(&format!("Pod error: {excerpt}"));
    }
    client.write_all(chunk).await
}

/// Trimmed, length-capped text of a diagnostic chunk; `None` if blank.
fn diagnostic_excerpt(chunk: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(chunk);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(DIAGNOSTIC_EXCERPT_CHARS).collect())
}
