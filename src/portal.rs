//! The portal: one node's view of the network.
//!
//! A [`Portal`] hosts the local [`Recipient`], owns the table of live connections keyed by peer
//! [`NodeId`], and routes outgoing envelopes to the right connection. It also knows how to reach
//! the directory, which hands out node identities and resolves resource names to the nodes serving
//! them.
//!
//! # Example
//!
//! ```no_run
//! use nodelink::{Invocation, Methods, Portal, PortalConfig};
//!
//! # async fn run() -> nodelink::error::Result<()> {
//! let portal = Portal::new(Methods::new("client"), PortalConfig::default());
//! portal.resolve_directory().await?;
//!
//! let catalog = portal.open_connection_to("catalog").await?;
//! let reply: String = catalog.ask_as(Invocation::synchronous("ping")).await?;
//! assert_eq!(reply, "pong");
//! # Ok(())
//! # }
//! ```

use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use futures::future::join_all;
use once_cell::sync::OnceCell;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{watch, Mutex},
    task::AbortHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::Payload,
    config::PortalConfig,
    connection::{Connection, ConnectionDirection, Inbound},
    correlator::Reply,
    envelope::{Envelope, Initialization, Invocation, ResourceIdentification},
    error::{RemoteError, Result},
    id::{IdentityIssuer, MessageId, NodeId},
    pool::WorkerPool,
    recipient::Recipient,
    registry::{ProxyRegistry, RemoteObject},
};

/// A node's entry point to the network. Cloning is cheap and clones share the same node.
#[derive(Clone)]
pub struct Portal {
    inner: Arc<PortalInner>,
}

pub(crate) struct PortalInner {
    config: PortalConfig,
    identity: watch::Sender<Option<NodeId>>,
    recipient: Arc<dyn Recipient>,
    pool: WorkerPool,
    connections: DashMap<NodeId, Connection>,
    live: DashMap<u64, Connection>,
    directory: Mutex<Option<Connection>>,
    issuer: Option<IdentityIssuer>,
    registry: ProxyRegistry,
    listeners: parking_lot::Mutex<Vec<AbortHandle>>,
    local_addr: OnceCell<SocketAddr>,
}

/// Builds a [`Portal`].
pub struct PortalBuilder {
    recipient: Arc<dyn Recipient>,
    config: PortalConfig,
    registry: ProxyRegistry,
    issue_identities: bool,
}

impl fmt::Debug for PortalBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("issue_identities", &self.issue_identities)
            .finish()
    }
}

impl PortalBuilder {
    /// Replaces the configuration.
    pub fn config(mut self, config: PortalConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the constructor for typed proxies of `resource`.
    pub fn proxy<T, F>(mut self, resource: impl Into<Cow<'static, str>>, constructor: F) -> Self
    where
        T: 'static,
        F: Fn(RemoteObject) -> T + Send + Sync + 'static,
    {
        let resource = resource.into();
        if !self.registry.insert(resource.clone(), constructor) {
            warn!(%resource, "proxy already registered, keeping the first");
        }
        self
    }

    /// Makes this portal act as the directory: every accepted connection is issued a fresh
    /// identity, starting from [`PortalConfig::first_issued_id`].
    pub fn issue_identities(mut self) -> Self {
        self.issue_identities = true;
        self
    }

    /// Builds the portal. No connection is opened until one is needed.
    pub fn build(self) -> Portal {
        let PortalBuilder {
            recipient,
            config,
            registry,
            issue_identities,
        } = self;

        let (identity, _) = watch::channel(config.node_id);
        if let Some(node_id) = config.node_id {
            recipient.set_node_id(node_id);
        }
        let issuer = issue_identities.then(|| IdentityIssuer::starting_at(config.first_issued_id));

        Portal {
            inner: Arc::new(PortalInner {
                pool: WorkerPool::new(config.worker_threads),
                config,
                identity,
                recipient,
                connections: DashMap::new(),
                live: DashMap::new(),
                directory: Mutex::new(None),
                issuer,
                registry,
                listeners: parking_lot::Mutex::new(Vec::new()),
                local_addr: OnceCell::new(),
            }),
        }
    }
}

impl Portal {
    /// Starts building a portal hosting `recipient`.
    pub fn builder(recipient: impl Recipient) -> PortalBuilder {
        PortalBuilder {
            recipient: Arc::new(recipient),
            config: PortalConfig::default(),
            registry: ProxyRegistry::new(),
            issue_identities: false,
        }
    }

    /// Creates a portal hosting `recipient` with the given configuration.
    pub fn new(recipient: impl Recipient, config: PortalConfig) -> Self {
        Portal::builder(recipient).config(config).build()
    }

    /// The configuration this portal was built with.
    pub fn config(&self) -> &PortalConfig {
        &self.inner.config
    }

    /// This node's identity, if assigned yet.
    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.node_id()
    }

    /// Waits until this node has been assigned an identity, for at most `deadline`.
    pub async fn wait_for_node_id(&self, deadline: Duration) -> Result<NodeId> {
        let mut identity = self.inner.identity.subscribe();
        let assigned = async { identity.wait_for(Option::is_some).await.map(|id| *id) };
        match tokio::time::timeout(deadline, assigned).await {
            Ok(Ok(Some(node_id))) => Ok(node_id),
            Ok(_) => Err(RemoteError::NotSendable("node has no identity")),
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    /// A fresh message id originating from this node.
    pub fn next_message_id(&self) -> Result<MessageId> {
        self.node_id()
            .map(MessageId::generate)
            .ok_or(RemoteError::NotSendable("node has no identity yet"))
    }

    /// The address this portal accepts connections on, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// The connection registered for `peer`, if any.
    pub fn connection(&self, peer: NodeId) -> Option<Connection> {
        self.inner.connection(peer)
    }

    /// Every peer with a registered connection.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.inner.connections.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }

    /// Sends `envelope` to `target` without waiting for anything in return.
    ///
    /// Fails with [`RemoteError::UnknownTarget`] if no connection is registered for the target.
    pub async fn dispatch_async(&self, envelope: &Envelope, target: NodeId) -> Result<()> {
        let connection = self
            .inner
            .connection(target)
            .ok_or(RemoteError::UnknownTarget(target))?;
        connection.send(envelope).await
    }

    /// Sends `envelope` to `target` and waits for the correlated reply.
    ///
    /// Returns `Ok(None)` if no connection is registered for the target: the envelope was
    /// undeliverable, which is different from a delivered call returning nothing.
    pub async fn dispatch_sync(&self, envelope: &Envelope, target: NodeId) -> Result<Option<Reply>> {
        let Some(connection) = self.inner.connection(target) else {
            debug!(%target, message_id = %envelope.message_id(), "undeliverable, no connection");
            return Ok(None);
        };
        connection.send_synchronous(envelope).await.map(Some)
    }

    /// Invokes a method on `target` and waits for its return value.
    pub async fn invoke(&self, target: NodeId, invocation: Invocation) -> Result<Option<Payload>> {
        let envelope = Envelope::new(
            self.own_id()?,
            self.next_message_id()?,
            invocation.with_synchronous(true),
        );
        self.dispatch_sync(&envelope, target)
            .await?
            .ok_or(RemoteError::UnknownTarget(target))?
            .into_value()
    }

    /// Invokes a method on `target` without waiting for it to run.
    pub async fn notify(&self, target: NodeId, invocation: Invocation) -> Result<()> {
        let envelope = Envelope::new(
            self.own_id()?,
            self.next_message_id()?,
            invocation.with_synchronous(false),
        );
        self.dispatch_async(&envelope, target).await
    }

    /// Connects to the directory and waits for it to assign this node an identity.
    ///
    /// Idempotent: while the directory connection stays open, later calls reuse it.
    pub async fn resolve_directory(&self) -> Result<Connection> {
        let directory_id = self.inner.config.directory_node_id;
        let connection = {
            let mut slot = self.inner.directory.lock().await;
            match slot.as_ref() {
                Some(connection) if connection.is_open() => connection.clone(),
                _ => {
                    let addr = self.inner.config.directory_address();
                    let stream = TcpStream::connect(&addr)
                        .await
                        .map_err(|err| RemoteError::connect(&addr, err))?;
                    let connection = self.inner.attach(
                        stream,
                        ConnectionDirection::Outbound,
                        Some(directory_id),
                    )?;
                    info!(%addr, directory = %directory_id, "connected to directory");
                    *slot = Some(connection.clone());
                    connection
                }
            }
        };

        if self.node_id().is_none() {
            let node_id = self
                .wait_for_node_id(self.inner.config.handshake_timeout)
                .await?;
            debug!(%node_id, "identity handshake complete");
        }
        Ok(connection)
    }

    /// Asks the directory which node serves `resource`, connects to it, and returns a handle for
    /// invoking methods on it.
    pub async fn open_connection_to(&self, resource: &str) -> Result<RemoteObject> {
        let directory_id = self.inner.config.directory_node_id;
        self.resolve_directory().await?;

        let key = self.inner.config.lookup_key(resource);
        let request = Envelope::new(
            self.own_id()?,
            self.next_message_id()?,
            ResourceIdentification::request(key),
        );
        let identity = self
            .dispatch_sync(&request, directory_id)
            .await?
            .ok_or(RemoteError::UnknownTarget(directory_id))?
            .into_resource()?;
        debug!(%resource, %key, node = %identity.node_id, object = %identity.object_name, "resolved resource");

        match self.inner.connection(identity.node_id) {
            Some(connection) if connection.is_open() => {
                debug!(node = %identity.node_id, "reusing existing connection");
            }
            _ => {
                let location = identity
                    .location
                    .ok_or_else(|| RemoteError::Unresolved(resource.to_string()))?;
                self.connect(location, identity.node_id).await?;
            }
        }

        Ok(RemoteObject::new(
            self.clone(),
            identity.node_id,
            identity.object_name,
        ))
    }

    /// A handle to `object_name` on a peer this portal is already connected to.
    pub fn remote(&self, node_id: NodeId, object_name: impl Into<String>) -> RemoteObject {
        RemoteObject::new(self.clone(), node_id, object_name.into())
    }

    /// Resolves `resource` and builds the typed proxy registered for it.
    pub async fn open_proxy<T>(&self, resource: &str) -> Result<T>
    where
        T: 'static,
    {
        if !self.inner.registry.contains_name(resource) {
            return Err(RemoteError::NoProxy(resource.to_string()));
        }
        let remote = self.open_connection_to(resource).await?;
        self.inner
            .registry
            .build(resource, remote)?
            .ok_or_else(|| RemoteError::NoProxy(resource.to_string()))
    }

    /// Dials `addr` and registers the connection as the one to `peer`.
    pub async fn connect(&self, addr: SocketAddr, peer: NodeId) -> Result<Connection> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| RemoteError::connect(addr, err))?;
        let connection = self
            .inner
            .attach(stream, ConnectionDirection::Outbound, Some(peer))?;
        info!(%addr, %peer, "connected to peer");
        Ok(connection)
    }

    /// Binds `addr` and accepts connections in the background until [`shutdown`](Portal::shutdown).
    ///
    /// Returns the bound address, which is useful when binding port 0.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(RemoteError::Bind)?;
        let local_addr = listener.local_addr().map_err(RemoteError::Bind)?;
        let _ = self.inner.local_addr.set(local_addr);

        let portal = self.clone();
        let handle = tokio::spawn(async move { portal.serve(listener).await });
        self.inner.listeners.lock().push(handle.abort_handle());
        Ok(local_addr)
    }

    /// Accepts connections from `listener` forever.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(local_addr) = listener.local_addr() {
            let _ = self.inner.local_addr.set(local_addr);
            info!(%local_addr, "accepting connections");
        }

        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => {
                    debug!(%remote_addr, "accepted connection");
                    if let Err(err) = self.accept(stream).await {
                        error!(%remote_addr, error = %err, "failed to set up accepted connection");
                    }
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Stops listening and closes every connection, releasing all pending callers.
    pub async fn shutdown(&self) {
        for listener in self.inner.listeners.lock().drain(..) {
            listener.abort();
        }

        let connections: Vec<Connection> = self
            .inner
            .live
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        join_all(connections.iter().map(Connection::close)).await;
        self.inner.directory.lock().await.take();
        info!(closed = connections.len(), "portal shut down");
    }

    async fn accept(&self, stream: TcpStream) -> Result<()> {
        let Some(issuer) = &self.inner.issuer else {
            self.inner
                .attach(stream, ConnectionDirection::Inbound, None)?;
            return Ok(());
        };

        let own_id = self.own_id()?;
        let issued = self.inner.issue_identity(issuer, own_id);
        let connection = self
            .inner
            .attach(stream, ConnectionDirection::Inbound, Some(issued))?;
        let envelope = Envelope::new(
            own_id,
            MessageId::generate(own_id),
            Initialization::new(issued),
        );
        connection.send(&envelope).await?;
        info!(peer = %issued, "issued identity");
        Ok(())
    }

    fn own_id(&self) -> Result<NodeId> {
        self.node_id()
            .ok_or(RemoteError::NotSendable("node has no identity yet"))
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal")
            .field("node_id", &self.node_id())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.connections.len())
            .field("issues_identities", &self.inner.issuer.is_some())
            .finish()
    }
}

impl PortalInner {
    pub(crate) fn node_id(&self) -> Option<NodeId> {
        *self.identity.borrow()
    }

    /// Records the identity assigned by the network. Returns `false` if one was already assigned.
    pub(crate) fn assign_identity(&self, node_id: NodeId) -> bool {
        self.identity.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(node_id);
            true
        })
    }

    pub(crate) fn recipient(&self) -> &Arc<dyn Recipient> {
        &self.recipient
    }

    pub(crate) fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub(crate) fn connection(&self, peer: NodeId) -> Option<Connection> {
        self.connections.get(&peer).map(|entry| entry.value().clone())
    }

    pub(crate) fn register_connection(&self, peer: NodeId, connection: &Connection) {
        if let Some(previous) = self.connections.insert(peer, connection.clone()) {
            if !previous.same_as(connection) {
                debug!(%peer, previous = previous.id(), current = connection.id(), "replaced connection");
            }
        }
    }

    /// Removes the entry for `peer` if it still maps to `connection`.
    pub(crate) fn unregister_connection(&self, peer: NodeId, connection: &Connection) -> bool {
        self.connections
            .remove_if(&peer, |_, current| current.same_as(connection))
            .is_some()
    }

    pub(crate) fn forget_connection(&self, connection: &Connection) {
        self.live.remove(&connection.id());
        if let Some(peer) = connection.peer() {
            if self.unregister_connection(peer, connection) {
                debug!(%peer, connection = connection.id(), "removed closed connection");
            }
        }
    }

    /// Issues an identity no registered peer already uses.
    fn issue_identity(&self, issuer: &IdentityIssuer, own_id: NodeId) -> NodeId {
        loop {
            let issued = issuer.issue();
            if issued != own_id && !self.connections.contains_key(&issued) {
                return issued;
            }
            debug!(skipped = %issued, "identity already in use");
        }
    }

    fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        direction: ConnectionDirection,
        peer: Option<NodeId>,
    ) -> Result<Connection> {
        let inbound: Weak<PortalInner> = Arc::downgrade(self);
        let inbound: Weak<dyn Inbound> = inbound;
        let connection = Connection::spawn(
            stream,
            direction,
            peer,
            self.config.connection_options(),
            inbound,
        )?;
        self.live.insert(connection.id(), connection.clone());
        if let Some(peer) = peer {
            self.register_connection(peer, &connection);
        }
        // The receive loop may have hit end of stream before the connection was recorded.
        if !connection.is_open() {
            self.forget_connection(&connection);
        }
        Ok(connection)
    }
}
