//! Node and message identity.
//!
//! A [`NodeId`] is handed to a node by the network (normally the directory) and never changes once
//! assigned. A [`MessageId`] names one logical exchange and is the key under which synchronous
//! callers wait for their response.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of a node on the network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// The identity the directory answers to unless configured otherwise.
    pub const DIRECTORY: NodeId = NodeId(0);

    /// Creates a `NodeId` from its raw value.
    pub const fn new(raw: u64) -> Self {
        NodeId(raw)
    }

    /// Returns the raw value of this id.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// A globally unique identifier for one logical exchange between nodes.
///
/// `MessageId` combines the originating node with a sequence number drawn from a process-wide
/// counter, so two ids generated in the same process never collide and ids from different nodes
/// are told apart by their origin.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    origin: NodeId,
    sequence: u64,
}

impl MessageId {
    /// Creates a `MessageId` from its parts.
    ///
    /// Prefer [`MessageId::generate`]; this exists for replaying ids decoded elsewhere and for tests.
    pub const fn new(origin: NodeId, sequence: u64) -> Self {
        MessageId { origin, sequence }
    }

    /// Generates a fresh `MessageId` originating from `origin`.
    pub fn generate(origin: NodeId) -> Self {
        MessageId {
            origin,
            sequence: MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The node which created this exchange.
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// The locally unique sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.sequence)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({}, {})", self.origin.0, self.sequence)
    }
}

/// Hands out fresh node identities when this portal acts as the directory.
#[derive(Debug)]
pub struct IdentityIssuer {
    next: AtomicU64,
}

impl IdentityIssuer {
    /// Creates an issuer whose first id is `first`.
    pub fn starting_at(first: NodeId) -> Self {
        IdentityIssuer {
            next: AtomicU64::new(first.0),
        }
    }

    /// Issues the next unused `NodeId`.
    pub fn issue(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
