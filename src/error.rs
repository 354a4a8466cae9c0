//! Defines error handling constructs for nodelink.
//!
//! Every fallible operation in the crate returns [`RemoteError`]. Local pre-flight failures
//! (`InvalidArgument`, `NotSendable`) never touch a socket; I/O faults (`ConnectionWriteFailure`,
//! `ConnectionLost`) are terminal for the connection they occurred on; protocol anomalies are
//! logged where they happen and only surface as errors to the caller that triggered them.

use std::io;

use crate::id::{MessageId, NodeId};

/// Result type used throughout nodelink.
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

/// Error that can occur when sending to or receiving from a remote node.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// An invocation argument could not be serialized.
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Position of the offending argument.
        index: usize,
        /// Why encoding failed.
        reason: String,
    },

    /// The connection has no resolved peer, the node has no identity yet, or the connection is
    /// already closed.
    #[error("not sendable: {0}")]
    NotSendable(&'static str),

    /// Writing a frame to the socket failed. The connection is closed afterwards.
    #[error("connection write failure: {0}")]
    ConnectionWriteFailure(#[source] io::Error),

    /// The connection was closed before a response arrived.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No connection is registered for the target node.
    #[error("no connection registered for {0}")]
    UnknownTarget(NodeId),

    /// A call is already outstanding under this message id.
    #[error("duplicate message id {0}")]
    DuplicateMessageId(MessageId),

    /// No response arrived before the deadline.
    #[error("timed out waiting for a response")]
    Timeout,

    /// A frame could not be decoded into an envelope, or a payload into the requested type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// An envelope or payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// A frame exceeded the configured maximum length.
    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    FrameTooLarge {
        /// Length of the rejected frame.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Establishing a connection failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Binding a listener failed.
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    /// The remote recipient failed while executing the invoked method.
    #[error("remote invocation failed: {0}")]
    Remote(String),

    /// The directory could not resolve a resource to a network location.
    #[error("resource '{0}' could not be resolved to a location")]
    Unresolved(String),

    /// No proxy constructor is registered under the name.
    #[error("no proxy registered for '{0}'")]
    NoProxy(String),

    /// A proxy was registered under the name, but for a different type.
    #[error("proxy registered for '{0}' has a different type")]
    BadProxyType(String),

    /// A response arrived, but of a different kind than the exchange expected.
    #[error("unexpected reply kind")]
    UnexpectedReply,
}

impl RemoteError {
    pub(crate) fn connect(addr: impl ToString, source: io::Error) -> Self {
        RemoteError::Connect {
            addr: addr.to_string(),
            source,
        }
    }

    /// Returns `true` for errors after which the connection can no longer be used.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            RemoteError::ConnectionWriteFailure(_)
                | RemoteError::ConnectionLost(_)
                | RemoteError::Decode(_)
                | RemoteError::FrameTooLarge { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for RemoteError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RemoteError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RemoteError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}
