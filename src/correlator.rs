//! Correlation of synchronous calls with their responses.
//!
//! A synchronous call is sent on the caller's task, while the matching response is decoded on the
//! connection's receive loop and handled on an arbitrary worker. The [`CallTable`] is the only
//! rendezvous between the two: the caller [`register`](CallTable::register)s a [`PendingCall`]
//! before sending, then awaits it; the worker [`complete`](CallTable::complete)s it by message id.
//! Each pending call is backed by a oneshot channel, so it is completed at most once and waiting
//! never polls.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::{mapref::entry::Entry, DashMap};
use once_cell::sync::OnceCell;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::{
    codec::Payload,
    envelope::ResourceIdentity,
    error::{RemoteError, Result},
    id::MessageId,
};

type Outcome = Result<Reply>;

/// The value delivered to a waiting caller.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// The return value of a synchronous invocation. `None` for a void method.
    Value(Option<Payload>),
    /// The answer to a resource identification.
    Resource(ResourceIdentity),
}

impl Reply {
    /// Returns the invocation's return value, failing if this is a resource answer.
    pub fn into_value(self) -> Result<Option<Payload>> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Resource(_) => Err(RemoteError::UnexpectedReply),
        }
    }

    /// Returns the resource answer, failing if this is an invocation's return value.
    pub fn into_resource(self) -> Result<ResourceIdentity> {
        match self {
            Reply::Resource(identity) => Ok(identity),
            Reply::Value(_) => Err(RemoteError::UnexpectedReply),
        }
    }
}

/// What happened to a completion handed to [`CallTable::complete`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// A waiting caller received the outcome.
    Delivered,
    /// Nobody was waiting on the message id; the outcome was discarded.
    Orphaned,
}

/// Outstanding synchronous calls on one connection, keyed by message id.
#[derive(Debug, Default)]
pub struct CallTable {
    pending: DashMap<MessageId, oneshot::Sender<Outcome>>,
    closed: AtomicBool,
    close_reason: OnceCell<String>,
    anomalies: AtomicU64,
}

impl CallTable {
    /// Creates an empty call table.
    pub fn new() -> Arc<Self> {
        Arc::new(CallTable::default())
    }

    /// Registers a new pending call under `message_id`.
    ///
    /// Fails with [`RemoteError::DuplicateMessageId`] if a call is already outstanding under the
    /// same id, and with [`RemoteError::ConnectionLost`] once the table has been failed.
    pub fn register(self: &Arc<Self>, message_id: MessageId) -> Result<PendingCall> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.lost());
        }

        let (tx, rx) = oneshot::channel();
        match self.pending.entry(message_id) {
            Entry::Occupied(_) => return Err(RemoteError::DuplicateMessageId(message_id)),
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }

        // `fail_all` may have drained the table between the check above and the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.pending.remove(&message_id);
            return Err(self.lost());
        }

        Ok(PendingCall {
            message_id,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Completes the pending call registered under `message_id`, releasing its caller.
    ///
    /// A completion for an id nobody waits on (never registered, already completed, or abandoned
    /// after a timeout) is a protocol anomaly: it is logged and counted, never fatal.
    pub fn complete(&self, message_id: MessageId, outcome: Result<Reply>) -> Completion {
        let Some((_, tx)) = self.pending.remove(&message_id) else {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            warn!(%message_id, "completion for an exchange nobody is waiting on");
            return Completion::Orphaned;
        };

        if tx.send(outcome).is_err() {
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            warn!(%message_id, "caller stopped waiting before its completion arrived");
            return Completion::Orphaned;
        }

        debug!(%message_id, "completed pending call");
        Completion::Delivered
    }

    /// Fails every pending call with [`RemoteError::ConnectionLost`] and refuses new ones.
    ///
    /// Returns the number of callers released.
    pub fn fail_all(&self, reason: &str) -> usize {
        let _ = self.close_reason.set(reason.to_string());
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<MessageId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut released = 0;
        for message_id in ids {
            if let Some((_, tx)) = self.pending.remove(&message_id) {
                let _ = tx.send(Err(self.lost()));
                released += 1;
            }
        }
        released
    }

    /// Number of calls currently awaiting completion.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no calls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` once [`fail_all`](CallTable::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of orphaned completions observed so far.
    pub fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    fn lost(&self) -> RemoteError {
        let reason = self
            .close_reason
            .get()
            .map(String::as_str)
            .unwrap_or("connection closed");
        RemoteError::ConnectionLost(reason.to_string())
    }
}

/// A caller's claim on one outstanding synchronous call.
///
/// Dropping a `PendingCall` without waiting (or after a timeout) removes its entry, so a late
/// response is reported as an orphaned completion rather than leaking.
#[derive(Debug)]
pub struct PendingCall {
    message_id: MessageId,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<CallTable>,
}

impl PendingCall {
    /// The message id this call is correlated by.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Waits until the call is completed, or until `deadline` elapses.
    pub async fn wait(self, deadline: Option<Duration>) -> Result<Reply> {
        self.wait_until(deadline.map(|deadline| Instant::now() + deadline))
            .await
    }

    /// Waits until the call is completed, or until the instant `deadline` is reached.
    pub async fn wait_until(mut self, deadline: Option<Instant>) -> Result<Reply> {
        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(message_id = %self.message_id, "pending call timed out");
                    return Err(RemoteError::Timeout);
                }
            },
            None => (&mut self.rx).await,
        };

        match received {
            Ok(outcome) => outcome,
            Err(_) => Err(self.table.lost()),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.table.pending.remove(&self.message_id);
    }
}
