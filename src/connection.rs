//! The connection actor.
//!
//! A [`Connection`] owns one TCP stream to one peer. The write half sits behind an exclusive lock,
//! so whole frames from concurrent senders never interleave. The read half belongs to a dedicated
//! receive loop, which decodes frames into envelopes and hands them over for handling without
//! running any handler logic itself.
//!
//! Any I/O fault, end of stream, or undecodable frame closes the connection. Closing releases
//! every pending synchronous caller with [`RemoteError::ConnectionLost`] and tells the owning
//! portal, which drops the connection from its table.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{Mutex, Notify},
    task::AbortHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    correlator::{CallTable, Reply},
    envelope::Envelope,
    error::{RemoteError, Result},
    framing,
    id::NodeId,
};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Receives what a connection's receive loop produces.
pub(crate) trait Inbound: Send + Sync + 'static {
    /// Takes a decoded envelope for handling. Must return without waiting on the handler.
    fn deliver(self: Arc<Self>, connection: Connection, envelope: Envelope);

    /// The connection learned its peer from an envelope it received. `previous` is the identity
    /// it was registered under before, if any.
    fn peer_resolved(&self, connection: &Connection, peer: NodeId, previous: Option<NodeId>);

    /// The connection has closed.
    fn closed(&self, connection: &Connection);
}

/// Per-connection limits, taken from the portal configuration.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectionOptions {
    pub max_frame_len: usize,
    pub call_timeout: Option<Duration>,
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Sending and receiving.
    Open = 0,
    /// Releasing pending calls; no longer sendable.
    Closing = 1,
    /// Fully closed.
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Which side dialed the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// Accepted by this node's listener.
    Inbound,
    /// Dialed by this node.
    Outbound,
}

enum PeerBinding {
    Unchanged,
    Bound(Option<NodeId>),
    Mismatch(NodeId),
}

/// A handle to one live connection. Cloning is cheap and clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    direction: ConnectionDirection,
    remote_addr: SocketAddr,
    peer: RwLock<Option<NodeId>>,
    writer: Mutex<OwnedWriteHalf>,
    calls: Arc<CallTable>,
    state: AtomicU8,
    closed: Notify,
    options: ConnectionOptions,
    reader: OnceCell<AbortHandle>,
    inbound: Weak<dyn Inbound>,
}

impl Connection {
    /// Takes ownership of `stream` and starts its receive loop.
    ///
    /// `peer` is known up front for connections this node dialed to a resolved node, and for
    /// connections the directory has just issued an identity to. Otherwise the connection stays
    /// unresolved until its first envelope arrives.
    pub(crate) fn spawn(
        stream: TcpStream,
        direction: ConnectionDirection,
        peer: Option<NodeId>,
        options: ConnectionOptions,
        inbound: Weak<dyn Inbound>,
    ) -> Result<Connection> {
        let remote_addr = stream
            .peer_addr()
            .map_err(|err| RemoteError::ConnectionLost(err.to_string()))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%remote_addr, error = %err, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed),
                direction,
                remote_addr,
                peer: RwLock::new(peer),
                writer: Mutex::new(writer),
                calls: CallTable::new(),
                state: AtomicU8::new(ConnectionState::Open as u8),
                closed: Notify::new(),
                options,
                reader: OnceCell::new(),
                inbound,
            }),
        };
        info!(
            connection = connection.id(),
            %remote_addr,
            ?direction,
            peer = ?peer,
            "connection opened"
        );

        let receiver = connection.clone();
        let handle = tokio::spawn(receiver.receive_loop(reader));
        let _ = connection.inner.reader.set(handle.abort_handle());

        Ok(connection)
    }

    /// Process-local id of this connection, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The peer on the other end, once resolved.
    pub fn peer(&self) -> Option<NodeId> {
        *self.inner.peer.read()
    }

    /// Address of the other end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Which side dialed.
    pub fn direction(&self) -> ConnectionDirection {
        self.inner.direction
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    /// Returns `true` while the connection can send.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of synchronous calls awaiting a response on this connection.
    pub fn pending_calls(&self) -> usize {
        self.inner.calls.len()
    }

    /// Number of responses that arrived for calls nobody was waiting on anymore.
    pub fn orphaned_completions(&self) -> u64 {
        self.inner.calls.anomalies()
    }

    /// Returns `true` if both handles refer to the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn calls(&self) -> &Arc<CallTable> {
        &self.inner.calls
    }

    /// Binds the connection to `source` if it has no peer yet, or if it is inbound and the peer
    /// names itself differently than it was registered.
    fn rebind_peer(&self, source: NodeId) -> PeerBinding {
        let mut peer = self.inner.peer.write();
        match *peer {
            Some(current) if current == source => PeerBinding::Unchanged,
            Some(current) if self.inner.direction == ConnectionDirection::Outbound => {
                PeerBinding::Mismatch(current)
            }
            previous => {
                *peer = Some(source);
                PeerBinding::Bound(previous)
            }
        }
    }

    /// Serializes `envelope` and transmits it as one frame.
    ///
    /// A write failure closes the connection. A write still in progress when the connection closes
    /// is abandoned with [`RemoteError::ConnectionLost`].
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.send_until(envelope, None).await
    }

    /// Sends `envelope` and waits for the correlated reply, within the configured call timeout.
    pub async fn send_synchronous(&self, envelope: &Envelope) -> Result<Reply> {
        self.send_synchronous_within(envelope, self.inner.options.call_timeout)
            .await
    }

    /// Sends `envelope` and waits for the correlated reply, for at most `deadline`.
    ///
    /// The deadline covers waiting for the write lock, writing the frame and waiting for the
    /// reply. Fails with [`RemoteError::NotSendable`] without touching the socket if the peer is not
    /// yet resolved or the connection is not open.
    pub async fn send_synchronous_within(
        &self,
        envelope: &Envelope,
        deadline: Option<Duration>,
    ) -> Result<Reply> {
        if self.peer().is_none() {
            return Err(RemoteError::NotSendable("connection has no resolved peer"));
        }
        if !self.is_open() {
            return Err(RemoteError::NotSendable("connection is closed"));
        }

        let deadline = deadline.map(|deadline| Instant::now() + deadline);
        let call = self.inner.calls.register(envelope.message_id())?;
        self.send_until(envelope, deadline).await?;
        call.wait_until(deadline).await
    }

    async fn send_until(&self, envelope: &Envelope, deadline: Option<Instant>) -> Result<()> {
        let closed = self.inner.closed.notified();
        if !self.is_open() {
            return Err(RemoteError::NotSendable("connection is closed"));
        }
        let body = envelope.to_vec()?;

        // Set once bytes may have reached the socket; abandoning the write after that leaves a
        // partial frame on the stream.
        let writing = AtomicBool::new(false);
        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writing.store(true, Ordering::Release);
            framing::write_frame(&mut *writer, &body, self.inner.options.max_frame_len).await
        };
        let bounded = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, write)
                    .await
                    .unwrap_or(Err(RemoteError::Timeout)),
                None => write.await,
            }
        };
        let written = tokio::select! {
            written = bounded => written,
            _ = closed => Err(RemoteError::ConnectionLost(
                "connection closed during write".to_string(),
            )),
        };

        match written {
            Ok(()) => {
                debug!(
                    connection = self.id(),
                    message_id = %envelope.message_id(),
                    kind = envelope.body().kind(),
                    expects_reply = envelope.expects_reply(),
                    len = body.len(),
                    "sent envelope"
                );
                Ok(())
            }
            Err(RemoteError::Timeout) if writing.load(Ordering::Acquire) => {
                warn!(
                    connection = self.id(),
                    peer = ?self.peer(),
                    message_id = %envelope.message_id(),
                    "write did not finish before the deadline"
                );
                self.shutdown("write did not finish before the deadline", false)
                    .await;
                Err(RemoteError::Timeout)
            }
            Err(err @ RemoteError::ConnectionWriteFailure(_)) => {
                error!(connection = self.id(), peer = ?self.peer(), error = %err, "write failed");
                self.shutdown(&err.to_string(), false).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Closes the connection, releasing every pending caller.
    pub async fn close(&self) {
        self.shutdown("connection closed locally", false).await;
    }

    /// Waits until the connection has closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.closed.notified();
            if self.state() == ConnectionState::Closed {
                return;
            }
            notified.await;
        }
    }

    async fn shutdown(&self, reason: &str, from_reader: bool) {
        let opened = self.inner.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if opened.is_err() {
            return;
        }

        let released = self.inner.calls.fail_all(reason);
        if !from_reader {
            if let Some(reader) = self.inner.reader.get() {
                reader.abort();
            }
        }

        info!(
            connection = self.id(),
            peer = ?self.peer(),
            released,
            reason,
            "connection closed"
        );
        if let Some(inbound) = self.inner.inbound.upgrade() {
            inbound.closed(self);
        }

        self.inner
            .state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.inner.closed.notify_waiters();

        let mut writer = self.inner.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            debug!(connection = self.id(), error = %err, "socket shutdown failed");
        }
    }

    async fn receive_loop(self, mut reader: OwnedReadHalf) {
        let max_frame_len = self.inner.options.max_frame_len;
        let reason = loop {
            let frame = match framing::read_frame(&mut reader, max_frame_len).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break "peer closed the connection".to_string(),
                Err(err) => {
                    error!(connection = self.id(), peer = ?self.peer(), error = %err, "read failed");
                    break err.to_string();
                }
            };

            let envelope = match Envelope::from_slice(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(connection = self.id(), peer = ?self.peer(), error = %err, "undecodable frame");
                    break err.to_string();
                }
            };

            if !self.route(envelope) {
                break "portal dropped".to_string();
            }
        };

        self.shutdown(&reason, true).await;
    }

    fn route(&self, envelope: Envelope) -> bool {
        let Some(inbound) = self.inner.inbound.upgrade() else {
            return false;
        };

        let source = envelope.source();
        debug!(
            connection = self.id(),
            %source,
            message_id = %envelope.message_id(),
            kind = envelope.body().kind(),
            "received envelope"
        );

        match self.rebind_peer(source) {
            PeerBinding::Unchanged => {}
            PeerBinding::Bound(previous) => {
                info!(
                    connection = self.id(),
                    peer = %source,
                    ?previous,
                    "resolved peer from envelope source"
                );
                inbound.peer_resolved(self, source, previous);
            }
            PeerBinding::Mismatch(current) => {
                warn!(
                    connection = self.id(),
                    peer = %current,
                    %source,
                    "envelope source does not match the connection's peer"
                );
            }
        }

        inbound.deliver(self.clone(), envelope);
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("remote_addr", &self.inner.remote_addr)
            .field("peer", &self.peer())
            .field("state", &self.state())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::{
        io::AsyncReadExt,
        net::TcpListener,
        time::timeout,
    };

    use super::*;
    use crate::{
        codec::Payload,
        envelope::{Body, Invocation, Response},
        id::MessageId,
    };

    const CLIENT: NodeId = NodeId::new(1);
    const SERVER: NodeId = NodeId::new(2);
    const WAIT: Duration = Duration::from_secs(5);

    /// Answers every synchronous invocation with its first argument.
    #[derive(Default)]
    struct Echo {
        resolved: AtomicUsize,
        closed: AtomicUsize,
    }

    impl Inbound for Echo {
        fn deliver(self: Arc<Self>, connection: Connection, envelope: Envelope) {
            tokio::spawn(async move {
                let message_id = envelope.message_id();
                match envelope.into_body() {
                    Body::Invocation(invocation) => {
                        let value = invocation.arguments().first().cloned();
                        let reply = Envelope::new(SERVER, message_id, Response::returning(value));
                        let _ = connection.send(&reply).await;
                    }
                    Body::Response(response) => {
                        let outcome = response
                            .into_outcome()
                            .map(Reply::Value)
                            .map_err(RemoteError::Remote);
                        connection.calls().complete(message_id, outcome);
                    }
                    _ => {}
                }
            });
        }

        fn peer_resolved(&self, _connection: &Connection, _peer: NodeId, _previous: Option<NodeId>) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }

        fn closed(&self, _connection: &Connection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn options() -> ConnectionOptions {
        ConnectionOptions {
            max_frame_len: framing::DEFAULT_MAX_FRAME_LEN,
            call_timeout: Some(WAIT),
        }
    }

    fn weak(echo: &Arc<Echo>) -> Weak<dyn Inbound> {
        let inbound: Arc<dyn Inbound> = echo.clone();
        Arc::downgrade(&inbound)
    }

    async fn pair(echo: &Arc<Echo>) -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let client = Connection::spawn(
            dialed.unwrap(),
            ConnectionDirection::Outbound,
            Some(SERVER),
            options(),
            weak(echo),
        )
        .unwrap();
        let server = Connection::spawn(
            accepted.unwrap().0,
            ConnectionDirection::Inbound,
            None,
            options(),
            weak(echo),
        )
        .unwrap();
        (client, server)
    }

    /// A connection whose other end is a raw socket under the test's control.
    async fn raw_pair(echo: &Arc<Echo>) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = Connection::spawn(
            dialed.unwrap(),
            ConnectionDirection::Outbound,
            Some(SERVER),
            options(),
            weak(echo),
        )
        .unwrap();
        (client, accepted.unwrap().0)
    }

    fn call(word: &str) -> Envelope {
        let invocation = Invocation::synchronous("echo").arg(word).unwrap();
        Envelope::new(CLIENT, MessageId::generate(CLIENT), invocation)
    }

    fn word(reply: Reply) -> String {
        reply.into_value().unwrap().unwrap().decode().unwrap()
    }

    #[tokio::test]
    async fn synchronous_call_gets_its_reply_and_resolves_the_server_side() {
        let echo = Arc::new(Echo::default());
        let (client, server) = pair(&echo).await;

        let reply = client.send_synchronous(&call("pong")).await.unwrap();
        assert_eq!(word(reply), "pong");
        assert_eq!(server.peer(), Some(CLIENT));
        assert_eq!(echo.resolved.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_each_get_their_own_reply() {
        let echo = Arc::new(Echo::default());
        let (client, _server) = pair(&echo).await;

        let callers: Vec<_> = (0..50)
            .map(|n| {
                let client = client.clone();
                tokio::spawn(async move {
                    let expected = format!("word-{n}");
                    let reply = client.send_synchronous(&call(&expected)).await.unwrap();
                    assert_eq!(word(reply), expected);
                })
            })
            .collect();

        for caller in callers {
            timeout(WAIT, caller).await.unwrap().unwrap();
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn unresolved_connection_is_not_sendable() {
        let echo = Arc::new(Echo::default());
        let (_client, server) = pair(&echo).await;

        let err = server.send_synchronous(&call("hello")).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotSendable(_)), "{err:?}");
        assert_eq!(server.pending_calls(), 0);
    }

    #[tokio::test]
    async fn peer_closing_releases_pending_callers() {
        let echo = Arc::new(Echo::default());
        let (client, mut raw) = raw_pair(&echo).await;

        tokio::spawn(async move {
            let mut header = [0u8; 4];
            raw.read_exact(&mut header).await.unwrap();
            drop(raw);
        });

        let err = timeout(WAIT, client.send_synchronous(&call("lost")))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RemoteError::ConnectionLost(_)), "{err:?}");

        timeout(WAIT, client.closed()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(echo.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_the_entry_is_discarded() {
        let echo = Arc::new(Echo::default());
        let (client, _raw) = raw_pair(&echo).await;

        let err = client
            .send_synchronous_within(&call("anyone"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout));
        assert_eq!(client.pending_calls(), 0);
        assert!(client.is_open());
    }

    #[tokio::test]
    async fn local_close_reaches_the_other_side() {
        let echo = Arc::new(Echo::default());
        let (client, server) = pair(&echo).await;

        client.close().await;
        assert!(matches!(
            client.send(&call("late")).await,
            Err(RemoteError::NotSendable(_))
        ));

        timeout(WAIT, server.closed()).await.unwrap();
        assert_eq!(echo.closed.load(Ordering::SeqCst), 2);
    }

    /// Larger than what loopback socket buffers absorb, so a peer that never reads stalls it.
    fn oversized_call() -> Envelope {
        let payload = Payload::from_bytes(vec![0u8; 15 * 1024 * 1024]);
        let invocation = Invocation::from_payloads("store", vec![payload], true);
        Envelope::new(CLIENT, MessageId::generate(CLIENT), invocation)
    }

    #[tokio::test]
    async fn stalled_peer_cannot_hold_a_caller_past_its_deadline() {
        let echo = Arc::new(Echo::default());
        let (client, _raw) = raw_pair(&echo).await;

        let err = timeout(
            WAIT,
            client.send_synchronous_within(&oversized_call(), Some(Duration::from_millis(200))),
        )
        .await
        .expect("deadline was not enforced")
        .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout), "{err:?}");

        // Part of the frame may be on the wire, so the stream can not be reused.
        assert!(!client.is_open());
        assert_eq!(client.pending_calls(), 0);
        assert_eq!(echo.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_abandons_a_stalled_write() {
        let echo = Arc::new(Echo::default());
        let (client, _raw) = raw_pair(&echo).await;

        let stalled = tokio::spawn({
            let client = client.clone();
            async move { client.send(&oversized_call()).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Waiting for the write lock times out without touching the stream.
        let err = client
            .send_synchronous_within(&call("queued"), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout), "{err:?}");
        assert!(client.is_open());

        timeout(WAIT, client.close()).await.expect("close waited on the writer");
        let err = timeout(WAIT, stalled).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, RemoteError::ConnectionLost(_)), "{err:?}");
    }

    #[tokio::test]
    async fn garbage_on_the_wire_closes_the_connection() {
        let echo = Arc::new(Echo::default());
        let (client, mut raw) = raw_pair(&echo).await;

        raw.write_all(&framing::write_frame_header(2)).await.unwrap();
        raw.write_all(&[0x92, 0x01]).await.unwrap();

        timeout(WAIT, client.closed()).await.unwrap();
        assert!(!client.is_open());
    }
}
