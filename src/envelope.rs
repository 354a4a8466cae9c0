//! The envelope protocol.
//!
//! Every value exchanged between nodes is an [`Envelope`]: the sender's [`NodeId`], the
//! [`MessageId`] of the exchange it belongs to, and one [`Body`] variant. `Body` is a closed enum,
//! so adding a variant forces every handler that matches on it to be updated.

use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

use crate::{
    codec::Payload,
    error::{RemoteError, Result},
    id::{MessageId, NodeId},
};

/// One self-describing message unit exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    source: NodeId,
    message_id: MessageId,
    body: Body,
}

impl Envelope {
    /// Creates an envelope sent by `source` as part of exchange `message_id`.
    pub fn new(source: NodeId, message_id: MessageId, body: impl Into<Body>) -> Self {
        Envelope {
            source,
            message_id,
            body: body.into(),
        }
    }

    /// The node which sent this envelope.
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// The exchange this envelope belongs to.
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// The variant-specific content.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Consumes the envelope, returning its content.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns `true` if the sender of this envelope waits for a correlated reply.
    pub fn expects_reply(&self) -> bool {
        match &self.body {
            Body::Invocation(invocation) => invocation.synchronous,
            Body::ResourceIdentification(identification) => !identification.returning,
            Body::Response(_) | Body::Initialization(_) => false,
        }
    }

    /// Serializes the envelope into a frame body.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes an envelope from a frame body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// The closed set of envelope kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// A request to run a method on the receiving node's recipient.
    Invocation(Invocation),
    /// The outcome of a synchronous invocation.
    Response(Response),
    /// Identity assignment for the receiving node.
    Initialization(Initialization),
    /// A resource lookup request, or its answer.
    ResourceIdentification(ResourceIdentification),
}

impl Body {
    /// Short name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Invocation(_) => "invocation",
            Body::Response(_) => "response",
            Body::Initialization(_) => "initialization",
            Body::ResourceIdentification(_) => "resource-identification",
        }
    }
}

impl From<Invocation> for Body {
    fn from(invocation: Invocation) -> Self {
        Body::Invocation(invocation)
    }
}

impl From<Response> for Body {
    fn from(response: Response) -> Self {
        Body::Response(response)
    }
}

impl From<Initialization> for Body {
    fn from(init: Initialization) -> Self {
        Body::Initialization(init)
    }
}

impl From<ResourceIdentification> for Body {
    fn from(identification: ResourceIdentification) -> Self {
        Body::ResourceIdentification(identification)
    }
}

/// A method call on the receiving node's recipient.
///
/// Arguments are serialized one by one as they are added, so an argument which cannot be
/// serialized is rejected with [`RemoteError::InvalidArgument`] while the invocation is built.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    method: String,
    arguments: Vec<Payload>,
    synchronous: bool,
}

impl Invocation {
    /// Creates a synchronous invocation, whose caller waits for a [`Response`].
    pub fn synchronous(method: impl Into<String>) -> Self {
        Invocation {
            method: method.into(),
            arguments: Vec::new(),
            synchronous: true,
        }
    }

    /// Creates an asynchronous (fire-and-forget) invocation.
    pub fn asynchronous(method: impl Into<String>) -> Self {
        Invocation {
            method: method.into(),
            arguments: Vec::new(),
            synchronous: false,
        }
    }

    /// Creates an invocation from arguments which are already encoded.
    pub fn from_payloads(method: impl Into<String>, arguments: Vec<Payload>, synchronous: bool) -> Self {
        Invocation {
            method: method.into(),
            arguments,
            synchronous,
        }
    }

    /// Appends an argument, serializing it immediately.
    pub fn arg<T>(mut self, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let index = self.arguments.len();
        let payload = Payload::encode(value).map_err(|err| RemoteError::InvalidArgument {
            index,
            reason: err.to_string(),
        })?;
        self.arguments.push(payload);
        Ok(self)
    }

    pub(crate) fn with_synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Name of the method to invoke.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The encoded arguments, in call order.
    pub fn arguments(&self) -> &[Payload] {
        &self.arguments
    }

    /// Returns `true` if the caller waits for a response.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("method", &self.method)
            .field("arguments", &self.arguments.len())
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

/// The outcome of a synchronous invocation, correlated by the envelope's message id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    outcome: Result<Option<Payload>, String>,
}

impl Response {
    /// A response carrying the method's return value, `None` for a void method.
    pub fn returning(value: Option<Payload>) -> Self {
        Response { outcome: Ok(value) }
    }

    /// A response reporting that the method failed on the remote recipient.
    pub fn failed(reason: impl Into<String>) -> Self {
        Response {
            outcome: Err(reason.into()),
        }
    }

    /// The return value, or the remote failure.
    pub fn outcome(&self) -> &Result<Option<Payload>, String> {
        &self.outcome
    }

    /// Consumes the response, returning its outcome.
    pub fn into_outcome(self) -> Result<Option<Payload>, String> {
        self.outcome
    }
}

/// Assigns the receiving node its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initialization {
    assigned: NodeId,
}

impl Initialization {
    /// Creates an initialization assigning `assigned` to the receiver.
    pub fn new(assigned: NodeId) -> Self {
        Initialization { assigned }
    }

    /// The identity assigned to the receiving node.
    pub fn assigned(&self) -> NodeId {
        self.assigned
    }
}

/// Where a named resource lives: the node serving it, the object name it is exposed under, and
/// (when the answer comes from the directory) the address to connect to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Node serving the resource.
    pub node_id: NodeId,
    /// Name of the object on that node.
    pub object_name: String,
    /// Network location of that node, if known.
    pub location: Option<SocketAddr>,
}

/// A resource lookup request (`returning == false`) or its answer (`returning == true`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIdentification {
    resource_name: String,
    returning: bool,
    resolved_node: Option<NodeId>,
    resolved_object: Option<String>,
    resolved_location: Option<SocketAddr>,
}

impl ResourceIdentification {
    /// Creates a lookup request for `resource_name`.
    pub fn request(resource_name: impl Into<String>) -> Self {
        ResourceIdentification {
            resource_name: resource_name.into(),
            returning: false,
            resolved_node: None,
            resolved_object: None,
            resolved_location: None,
        }
    }

    /// Fills in the answer and flips the envelope so it travels back to the requester.
    pub fn answer(mut self, identity: ResourceIdentity) -> Self {
        self.resolved_node = Some(identity.node_id);
        self.resolved_object = Some(identity.object_name);
        self.resolved_location = identity.location;
        self.returning = true;
        self
    }

    /// Flips the envelope back to the requester without an answer.
    pub fn unresolved(mut self) -> Self {
        self.returning = true;
        self
    }

    /// The resource being looked up.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Returns `true` if this is the answer travelling back to the requester.
    pub fn is_returning(&self) -> bool {
        self.returning
    }

    /// Node resolved for the resource, if answered.
    pub fn resolved_node(&self) -> Option<NodeId> {
        self.resolved_node
    }

    /// Object name resolved for the resource, if answered.
    pub fn resolved_object(&self) -> Option<&str> {
        self.resolved_object.as_deref()
    }

    /// Network location resolved for the resource, if any.
    pub fn resolved_location(&self) -> Option<SocketAddr> {
        self.resolved_location
    }

    /// The answer as a [`ResourceIdentity`], or `None` if it is missing its node or object name.
    pub fn identity(&self) -> Option<ResourceIdentity> {
        Some(ResourceIdentity {
            node_id: self.resolved_node?,
            object_name: self.resolved_object.clone()?,
            location: self.resolved_location,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Serializer;

    use super::*;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize a socket"))
        }
    }

    fn envelope(body: impl Into<Body>) -> Envelope {
        Envelope::new(NodeId::new(1), MessageId::new(NodeId::new(1), 10), body)
    }

    #[test]
    fn invocation_survives_the_wire() {
        let invocation = Invocation::synchronous("add")
            .arg(&2u32)
            .unwrap()
            .arg("three")
            .unwrap();
        let env = envelope(invocation);

        let decoded = Envelope::from_slice(&env.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.source(), NodeId::new(1));
        assert_eq!(decoded.message_id(), MessageId::new(NodeId::new(1), 10));

        let Body::Invocation(invocation) = decoded.into_body() else {
            panic!("expected an invocation");
        };
        assert_eq!(invocation.method(), "add");
        assert!(invocation.is_synchronous());
        assert_eq!(invocation.arguments()[0].decode::<u32>().unwrap(), 2);
        assert_eq!(invocation.arguments()[1].decode::<String>().unwrap(), "three");
    }

    #[test]
    fn void_and_failed_responses_are_distinct() {
        let void = envelope(Response::returning(None));
        let failed = envelope(Response::failed("boom"));

        let void = Envelope::from_slice(&void.to_vec().unwrap()).unwrap();
        let failed = Envelope::from_slice(&failed.to_vec().unwrap()).unwrap();

        assert_eq!(void.body(), &Body::Response(Response::returning(None)));
        assert_eq!(failed.body(), &Body::Response(Response::failed("boom")));
    }

    #[test]
    fn unserializable_argument_is_rejected_at_construction() {
        let err = Invocation::asynchronous("open")
            .arg(&1u8)
            .unwrap()
            .arg(&Unserializable)
            .unwrap_err();
        assert!(
            matches!(err, RemoteError::InvalidArgument { index: 1, .. }),
            "unexpected error {err:?}"
        );
    }

    #[test]
    fn answering_a_resource_request_flips_it() {
        let request = ResourceIdentification::request("catalog");
        let env = envelope(request.clone());
        assert!(env.expects_reply());
        assert_eq!(request.identity(), None);

        let location: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let answer = request.answer(ResourceIdentity {
            node_id: NodeId::new(5),
            object_name: "catalog-service".into(),
            location: Some(location),
        });
        let env = envelope(answer.clone());
        assert!(!env.expects_reply());
        assert!(answer.is_returning());
        assert_eq!(answer.resource_name(), "catalog");

        let decoded = Envelope::from_slice(&env.to_vec().unwrap()).unwrap();
        let Body::ResourceIdentification(decoded) = decoded.into_body() else {
            panic!("expected a resource identification");
        };
        assert_eq!(
            decoded.identity(),
            Some(ResourceIdentity {
                node_id: NodeId::new(5),
                object_name: "catalog-service".into(),
                location: Some(location),
            })
        );
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            Envelope::from_slice(&[0x92, 0x01]),
            Err(RemoteError::Decode(_))
        ));
    }
}
