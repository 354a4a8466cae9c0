#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod envelope;
pub mod error;
pub(crate) mod framing;
mod handler;
pub mod id;
pub mod pool;
pub mod portal;
pub mod recipient;
pub mod registry;

pub use codec::Payload;
pub use config::PortalConfig;
pub use connection::Connection;
pub use correlator::{CallTable, Reply};
pub use envelope::{Envelope, Invocation, ResourceIdentity};
pub use error::RemoteError;
pub use id::{MessageId, NodeId};
pub use portal::{Portal, PortalBuilder};
pub use recipient::{decode_arg, InvocationError, Methods, Recipient};
pub use registry::{ProxyRegistry, RemoteObject};
