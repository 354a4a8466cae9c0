//! Serialization of values carried inside envelopes.
//!
//! Invocation arguments and return values travel as [`Payload`]s: opaque byte strings that were
//! MessagePack-encoded on their own, independently of the envelope around them. Encoding happens
//! when the envelope is built, so a value that cannot be serialized is rejected before anything
//! reaches the wire.

use std::{error, fmt};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An error that occurs during payload encode/decode operations.
#[derive(Clone, PartialEq, Eq)]
pub struct CodecError(String);

impl CodecError {
    /// Create a new codec error from any displayable value.
    pub fn new(err: impl fmt::Display) -> Self {
        CodecError(err.to_string())
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecError({:?})", self.0)
    }
}

impl error::Error for CodecError {}

/// A single serialized value: one invocation argument or one return value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Bytes);

impl Payload {
    /// Serializes `value` into a payload.
    pub fn encode<T>(value: &T) -> Result<Self, CodecError>
    where
        T: Serialize + ?Sized,
    {
        rmp_serde::to_vec_named(value)
            .map(|bytes| Payload(Bytes::from(bytes)))
            .map_err(CodecError::new)
    }

    /// Deserializes the payload into `T`.
    pub fn decode<T>(&self) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        rmp_serde::from_slice(&self.0).map_err(CodecError::new)
    }

    /// Wraps bytes that are already MessagePack-encoded.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Payload(bytes.into())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}
