//! The local object that executes incoming invocations.
//!
//! Each portal hosts exactly one [`Recipient`]. Incoming invocations name a method and carry
//! encoded arguments; the recipient maps the name onto behaviour. Mapping is explicit, there is no
//! reflection: implement the trait by hand, or register closures on a [`Methods`] table.

use std::{collections::HashMap, fmt};

use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

use crate::{
    codec::{CodecError, Payload},
    envelope::ResourceIdentity,
    id::NodeId,
};

/// Executes invocations addressed to this node.
///
/// Methods are plain synchronous code and may block; the portal runs them on tokio's blocking
/// threads.
pub trait Recipient: Send + Sync + 'static {
    /// Runs `method` with the given encoded arguments.
    ///
    /// Returns `Ok(None)` for a method without a return value.
    fn invoke_method(&self, method: &str, args: &[Payload]) -> Result<Option<Payload>, InvocationError>;

    /// Called once, when the network assigns this node its identity.
    fn set_node_id(&self, _node_id: NodeId) {}

    /// Name of the resource this node exposes.
    fn resource_name(&self) -> String {
        String::new()
    }

    /// Answers a resource identification request, `None` if the resource is unknown.
    ///
    /// The default answers with this node itself. A directory overrides this to point requesters
    /// at other nodes.
    fn identify(&self, own_id: NodeId, _requested: &str) -> Option<ResourceIdentity> {
        Some(ResourceIdentity {
            node_id: own_id,
            object_name: self.resource_name(),
            location: None,
        })
    }
}

/// Reasons a recipient can fail to execute a method.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The recipient has no method with this name.
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    /// An argument was missing or could not be decoded.
    #[error("bad argument {index}: {reason}")]
    BadArgument {
        /// Position of the argument.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The return value could not be encoded.
    #[error("failed to encode return value: {0}")]
    Encode(#[from] CodecError),

    /// The method ran and failed.
    #[error("{0}")]
    Failed(String),
}

impl InvocationError {
    /// Creates a [`InvocationError::Failed`] from any displayable error.
    pub fn failed(err: impl fmt::Display) -> Self {
        InvocationError::Failed(err.to_string())
    }
}

/// Decodes the argument at `index` into `T`.
pub fn decode_arg<T>(args: &[Payload], index: usize) -> Result<T, InvocationError>
where
    T: DeserializeOwned,
{
    let payload = args.get(index).ok_or_else(|| InvocationError::BadArgument {
        index,
        reason: format!("missing, only {} given", args.len()),
    })?;
    payload.decode().map_err(|err| InvocationError::BadArgument {
        index,
        reason: err.to_string(),
    })
}

type Method = Box<dyn Fn(&[Payload]) -> Result<Option<Payload>, InvocationError> + Send + Sync>;

/// A [`Recipient`] backed by a table of named closures.
///
/// # Example
///
/// ```
/// use nodelink::{Methods, Payload};
///
/// let methods = Methods::new("echo-service")
///     .with("ping", |_args| Ok(Some(Payload::encode("pong")?)))
///     .with("log", |_args| Ok(None));
/// ```
pub struct Methods {
    resource_name: String,
    methods: HashMap<String, Method>,
    node_id: OnceCell<NodeId>,
}

impl Methods {
    /// Creates an empty table for a node exposing `resource_name`.
    pub fn new(resource_name: impl Into<String>) -> Self {
        Methods {
            resource_name: resource_name.into(),
            methods: HashMap::new(),
            node_id: OnceCell::new(),
        }
    }

    /// Registers `method` under `name`, replacing any previous method with that name.
    pub fn with<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&[Payload]) -> Result<Option<Payload>, InvocationError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(method));
        self
    }

    /// The identity assigned to this node, once known.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id.get().copied()
    }
}

impl Recipient for Methods {
    fn invoke_method(&self, method: &str, args: &[Payload]) -> Result<Option<Payload>, InvocationError> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| InvocationError::UnknownMethod(method.to_string()))?;
        f(args)
    }

    fn set_node_id(&self, node_id: NodeId) {
        let _ = self.node_id.set(node_id);
    }

    fn resource_name(&self) -> String {
        self.resource_name.clone()
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Methods")
            .field("resource_name", &self.resource_name)
            .field("methods", &names)
            .field("node_id", &self.node_id.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> Methods {
        Methods::new("calculator").with("add", |args| {
            let a: i64 = decode_arg(args, 0)?;
            let b: i64 = decode_arg(args, 1)?;
            Ok(Some(Payload::encode(&(a + b))?))
        })
    }

    #[test]
    fn registered_method_is_invoked() {
        let args = [Payload::encode(&2i64).unwrap(), Payload::encode(&3i64).unwrap()];
        let result = adder().invoke_method("add", &args).unwrap().unwrap();
        assert_eq!(result.decode::<i64>().unwrap(), 5);
    }

    #[test]
    fn unknown_method_is_reported() {
        let err = adder().invoke_method("sub", &[]).unwrap_err();
        assert!(matches!(err, InvocationError::UnknownMethod(name) if name == "sub"));
    }

    #[test]
    fn missing_argument_is_reported_with_its_index() {
        let args = [Payload::encode(&2i64).unwrap()];
        let err = adder().invoke_method("add", &args).unwrap_err();
        assert!(matches!(err, InvocationError::BadArgument { index: 1, .. }));
    }

    #[test]
    fn default_identification_answers_with_self() {
        let identity = adder().identify(NodeId::new(4), "anything").unwrap();
        assert_eq!(identity.node_id, NodeId::new(4));
        assert_eq!(identity.object_name, "calculator");
        assert_eq!(identity.location, None);
    }

    #[test]
    fn node_id_is_set_once() {
        let methods = adder();
        methods.set_node_id(NodeId::new(1));
        methods.set_node_id(NodeId::new(2));
        assert_eq!(methods.node_id(), Some(NodeId::new(1)));
    }
}
