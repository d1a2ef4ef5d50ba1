//! Forward lifecycle: create, list, stop and observe forward rules.
//!
//! All rule state lives in one [`Registry`] behind one mutex. Every mutation
//! queues its event on the [`EventBus`] while still holding that lock, and
//! the queue is delivered once the lock is released. Observers therefore see
//! events in exactly the order the mutations happened, a `remove` is never
//! followed by another event for the same id, and an observer may call back
//! into the manager.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveTime, Utc};
use common::{ForwardEvent, ForwardRule, ForwardSpec, ForwardStatus, ResourceKind};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::ChannelOpener;
use crate::cluster::ClusterClient;
use crate::error::ForwardError;
use crate::events::{EventBus, ObserverError, Subscription};
use crate::proxy::{self, ClientConnection, ConnectionGuard, Connector, ForwardTarget};
use crate::registry::{ActiveForward, ListenerHandle, Registry};
use crate::resolver::TargetResolver;

/// How long `stop_forward` waits for an accept loop to release its port.
const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunables for [`ForwardManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Address local listeners bind to.
    pub bind_addr: IpAddr,
    /// How long `shutdown` lets open connections drain before cancelling them.
    pub shutdown_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Registry plus the bus its mutations are published on.
pub(crate) struct Shared {
    registry: Mutex<Registry>,
    bus: Arc<EventBus>,
}

impl Shared {
    /// Run `f` on the live rule `id` and queue the events it returns under the
    /// registry lock, then deliver them. Returns `false`, doing nothing, once
    /// the rule is gone.
    fn mutate<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ForwardRule) -> Vec<ForwardEvent>,
    {
        let live = {
            let mut registry = self.registry.lock();
            match registry.rule_mut(id) {
                Some(rule) => {
                    for event in f(rule) {
                        self.bus.enqueue(event);
                    }
                    true
                }
                None => false,
            }
        };
        self.bus.flush();
        live
    }
}

/// A rule's view of the manager, held by its accept loop and connections.
#[derive(Clone)]
pub(crate) struct RuleHandle {
    id: Arc<str>,
    shared: Arc<Shared>,
}

impl RuleHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a timestamped line to the rule's log.
    pub fn log(&self, message: &str) {
        self.shared.mutate(&self.id, |rule| {
            let entry = rule.append_log(clock(), message);
            vec![ForwardEvent::Log {
                id: rule.id.clone(),
                message: entry,
            }]
        });
    }

    /// Count a new client. `false` if the rule has already been stopped.
    pub fn connection_opened(&self) -> bool {
        self.shared.mutate(&self.id, |rule| {
            rule.connections = rule.connections.saturating_add(1);
            vec![stat(rule)]
        })
    }

    pub fn connection_closed(&self) {
        self.shared.mutate(&self.id, |rule| {
            rule.connections = rule.connections.saturating_sub(1);
            vec![stat(rule)]
        });
    }

    /// The listener failed: the rule moves to `error` and stops accepting.
    pub fn listener_fault(&self, message: &str) {
        self.shared.mutate(&self.id, |rule| {
            rule.status = ForwardStatus::Error;
            rule.error = Some(message.to_owned());
            let entry = rule.append_log(clock(), &format!("Server error: {message}"));
            vec![
                ForwardEvent::Log {
                    id: rule.id.clone(),
                    message: entry,
                },
                ForwardEvent::Update {
                    forward: rule.clone(),
                },
            ]
        });
    }
}

fn stat(rule: &ForwardRule) -> ForwardEvent {
    ForwardEvent::Stat {
        id: rule.id.clone(),
        connections: rule.connections,
    }
}

fn clock() -> NaiveTime {
    Local::now().time()
}

struct Inner {
    shared: Arc<Shared>,
    connector: Arc<Connector>,
    options: ManagerOptions,
    /// Tracks every client connection task.
    connections: TaskTracker,
    /// Cancelled on shutdown; parent of every listener token.
    shutdown: CancellationToken,
}

/// Owns every forward rule, its listener and its connections.
///
/// Cloning is cheap; clones share the same rules.
#[derive(Clone)]
pub struct ForwardManager {
    inner: Arc<Inner>,
}

impl ForwardManager {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        opener: Arc<dyn ChannelOpener>,
        options: ManagerOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            bus: EventBus::new(),
        });
        let connector = Arc::new(Connector {
            resolver: TargetResolver::new(cluster),
            opener,
        });
        Self {
            inner: Arc::new(Inner {
                shared,
                connector,
                options,
                connections: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Snapshots of every rule, oldest first.
    pub fn list(&self) -> Vec<ForwardRule> {
        self.inner.shared.registry.lock().list()
    }

    pub fn get(&self, id: &str) -> Option<ForwardRule> {
        self.inner.shared.registry.lock().get(id)
    }

    /// Number of live event subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.shared.bus.subscriber_count()
    }

    /// Number of client connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    /// Create a forward and start accepting on its local port.
    ///
    /// Service targets are resolved once up front so an unusable service is
    /// rejected without holding the port; each connection resolves again.
    ///
    /// # Errors
    ///
    /// - [`ForwardError::InvalidArgument`] for empty names or zero ports.
    /// - [`ForwardError::PortInUse`] if a `running` rule owns the port.
    /// - [`ForwardError::Resolution`] if a service target has no running pod.
    /// - [`ForwardError::Bind`] if the listener cannot be bound.
    pub async fn create_forward(&self, spec: ForwardSpec) -> Result<ForwardRule, ForwardError> {
        validate(&spec)?;
        self.check_port(spec.local_port)?;

        if spec.resource_type == ResourceKind::Service {
            self.inner
                .connector
                .resolver
                .resolve(&spec.namespace, spec.resource_type, &spec.resource_name)
                .await?;
        }

        let id = Uuid::new_v4().to_string();
        let mut rule = ForwardRule::new(id.as_str(), &spec, Utc::now());
        rule.append_log(
            clock(),
            &format!(
                "Starting {}:{} → {}/{}",
                spec.local_port, spec.remote_port, spec.namespace, spec.resource_name
            ),
        );

        let addr = SocketAddr::new(self.inner.options.bind_addr, spec.local_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ForwardError::Bind { addr, source })?;
        let local_addr = listener.local_addr().unwrap_or(addr);
        rule.append_log(clock(), &format!("Listening on {local_addr}"));

        let target = ForwardTarget {
            namespace: spec.namespace.clone(),
            kind: spec.resource_type,
            name: spec.resource_name.clone(),
            remote_port: spec.remote_port,
        };
        let handle = RuleHandle {
            id: Arc::from(id.as_str()),
            shared: self.inner.shared.clone(),
        };
        let cancel = self.inner.shutdown.child_token();
        let mut listener_handle = ListenerHandle::new(local_addr, cancel.clone());

        let snapshot = rule.clone();
        {
            let mut registry = self.inner.shared.registry.lock();
            // Another create may have won the port while we were binding.
            if let Some(owner) = registry.running_on_port(spec.local_port) {
                return Err(port_in_use(owner));
            }

            // The loop's first mutation blocks on this lock until `add` is queued.
            let task = tokio::spawn(accept_loop(AcceptLoop {
                listener,
                rule: handle,
                target,
                connector: self.inner.connector.clone(),
                connections: self.inner.connections.clone(),
                shutdown: self.inner.shutdown.clone(),
                cancel,
            }));
            listener_handle.attach(task);

            registry.insert(ActiveForward::new(rule, listener_handle))?;
            self.inner.shared.bus.enqueue(ForwardEvent::Add {
                forward: snapshot.clone(),
            });
        }
        self.inner.shared.bus.flush();

        info!(
            rule_id = %snapshot.id,
            local_addr = %local_addr,
            namespace = %snapshot.namespace,
            resource_type = %snapshot.resource_type,
            resource_name = %snapshot.resource_name,
            remote_port = snapshot.remote_port,
            "forward started"
        );
        Ok(snapshot)
    }

    /// Stop and remove a rule. Returns `false` if `id` is unknown.
    ///
    /// The port is released before this returns; connections already accepted
    /// keep running until their peers close.
    pub async fn stop_forward(&self, id: &str) -> bool {
        let (rule, listener) = {
            let mut registry = self.inner.shared.registry.lock();
            // Stop accepting before the rule disappears; a client accepted
            // just before this finds the rule gone and is dropped uncounted.
            if !registry.cancel_listener(id) {
                return false;
            }
            let Some(forward) = registry.remove(id) else {
                return false;
            };
            let (mut rule, listener) = forward.into_parts();
            rule.status = ForwardStatus::Stopped;
            self.inner.shared.bus.enqueue(ForwardEvent::Remove { id: rule.id.clone() });
            (rule, listener)
        };
        self.inner.shared.bus.flush();

        listener.close(LISTENER_CLOSE_TIMEOUT).await;
        info!(rule_id = %rule.id, local_port = rule.local_port, status = ?rule.status, "forward stopped");
        true
    }

    /// Stop every rule.
    pub async fn stop_all(&self) {
        let ids = self.inner.shared.registry.lock().ids();
        for id in ids {
            self.stop_forward(&id).await;
        }
    }

    /// Stop every rule, let open connections drain for the configured grace
    /// period, then cancel whatever is left.
    pub async fn shutdown(&self) {
        self.stop_all().await;

        let connections = &self.inner.connections;
        connections.close();
        let grace = self.inner.options.shutdown_grace;
        if tokio::time::timeout(grace, connections.wait()).await.is_err() {
            warn!(remaining = connections.len(), "cancelling connections still open after grace period");
        }
        self.inner.shutdown.cancel();
        if tokio::time::timeout(LISTENER_CLOSE_TIMEOUT, connections.wait())
            .await
            .is_err()
        {
            warn!(remaining = connections.len(), "connections did not finish after cancellation");
        }
        info!("forward manager shut down");
    }

    /// Observe rule events.
    ///
    /// `observer` first receives an `init` event with the current rule list,
    /// then every later event, in order, until the [`Subscription`] is dropped.
    /// Observers run outside the registry lock and may call back into the
    /// manager; unless another thread is delivering events at that moment,
    /// `init` has been delivered by the time this returns.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ForwardEvent) -> Result<(), ObserverError> + Send + Sync + 'static,
    {
        let subscription = {
            let registry = self.inner.shared.registry.lock();
            let init = ForwardEvent::Init {
                forwards: registry.list(),
            };
            self.inner.shared.bus.subscribe(init, observer)
        };
        self.inner.shared.bus.flush();
        subscription
    }

    fn check_port(&self, port: u16) -> Result<(), ForwardError> {
        match self.inner.shared.registry.lock().running_on_port(port) {
            Some(owner) => Err(port_in_use(owner)),
            None => Ok(()),
        }
    }
}

fn validate(spec: &ForwardSpec) -> Result<(), ForwardError> {
    if spec.namespace.trim().is_empty() {
        return Err(ForwardError::InvalidArgument("namespace must not be empty".into()));
    }
    if spec.resource_name.trim().is_empty() {
        return Err(ForwardError::InvalidArgument("resourceName must not be empty".into()));
    }
    if spec.local_port == 0 {
        return Err(ForwardError::InvalidArgument("Invalid localPort".into()));
    }
    if spec.remote_port == 0 {
        return Err(ForwardError::InvalidArgument("Invalid remotePort".into()));
    }
    Ok(())
}

fn port_in_use(owner: &ForwardRule) -> ForwardError {
    ForwardError::PortInUse {
        port: owner.local_port,
        resource: owner.resource_name.clone(),
    }
}

/// Source of client sockets for an accept loop.
#[async_trait]
pub(crate) trait Acceptor: Send + Sync + 'static {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

struct AcceptLoop<L> {
    listener: L,
    rule: RuleHandle,
    target: ForwardTarget,
    connector: Arc<Connector>,
    connections: TaskTracker,
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

/// Accept clients until cancelled or the listener fails.
async fn accept_loop<L: Acceptor>(ctx: AcceptLoop<L>) {
    let AcceptLoop {
        listener,
        rule,
        target,
        connector,
        connections,
        shutdown,
        cancel,
    } = ctx;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                let Some(guard) = ConnectionGuard::open(rule.clone()) else {
                    debug!(rule_id = %rule.id(), %peer, "rule stopped; dropping client");
                    break;
                };
                debug!(rule_id = %rule.id(), %peer, "accepted client");
                let conn = ClientConnection {
                    guard,
                    rule: rule.clone(),
                    stream,
                    peer,
                };
                connections.spawn(proxy::serve(
                    conn,
                    target.clone(),
                    connector.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) if is_transient(&e) => {
                debug!(rule_id = %rule.id(), error = %e, "transient accept error");
            }
            Err(e) => {
                let fault = ForwardError::ListenerFault(e.to_string());
                error!(rule_id = %rule.id(), error = %fault, "listener failed");
                rule.listener_fault(&fault.to_string());
                break;
            }
        }
    }
    debug!(rule_id = %rule.id(), "accept loop exited");
}

/// Accept errors that concern a single half-open connection, not the listener.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
