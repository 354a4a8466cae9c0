//! Handling of decoded envelopes.
//!
//! The receive loop of every connection hands its envelopes to the portal, which queues them on
//! its worker pool. Handling is a match over the closed set of [`Body`] variants.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    codec::Payload,
    connection::{Connection, Inbound},
    correlator::Reply,
    envelope::{Body, Envelope, Invocation, Response, ResourceIdentification},
    error::RemoteError,
    id::{MessageId, NodeId},
    pool::WorkerPool,
    portal::PortalInner,
};

impl Inbound for PortalInner {
    fn deliver(self: Arc<Self>, connection: Connection, envelope: Envelope) {
        let pool = self.pool().clone();
        pool.submit(async move {
            handle(&self, &connection, envelope).await;
        });
    }

    fn peer_resolved(&self, connection: &Connection, peer: NodeId, previous: Option<NodeId>) {
        if let Some(previous) = previous {
            self.unregister_connection(previous, connection);
        }
        self.register_connection(peer, connection);
    }

    fn closed(&self, connection: &Connection) {
        self.forget_connection(connection);
    }
}

async fn handle(portal: &PortalInner, connection: &Connection, envelope: Envelope) {
    let source = envelope.source();
    let message_id = envelope.message_id();
    match envelope.into_body() {
        Body::Invocation(invocation) => {
            handle_invocation(portal, connection, message_id, invocation).await
        }
        Body::Response(response) => {
            let outcome = response
                .into_outcome()
                .map(Reply::Value)
                .map_err(RemoteError::Remote);
            connection.calls().complete(message_id, outcome);
        }
        Body::Initialization(init) => {
            handle_initialization(portal, source, init.assigned()).await
        }
        Body::ResourceIdentification(identification) if identification.is_returning() => {
            let outcome = identification
                .identity()
                .map(Reply::Resource)
                .ok_or_else(|| RemoteError::Unresolved(identification.resource_name().to_string()));
            connection.calls().complete(message_id, outcome);
        }
        Body::ResourceIdentification(identification) => {
            handle_identification(portal, connection, message_id, identification).await
        }
    }
}

async fn handle_invocation(
    portal: &PortalInner,
    connection: &Connection,
    message_id: MessageId,
    invocation: Invocation,
) {
    let synchronous = invocation.is_synchronous();
    let method = invocation.method().to_string();
    let outcome = invoke(portal, invocation).await;

    if !synchronous {
        if let Err(reason) = outcome {
            warn!(%message_id, %method, %reason, "asynchronous invocation failed");
        }
        return;
    }

    let Some(own_id) = portal.node_id() else {
        warn!(%message_id, %method, "cannot respond before this node has an identity");
        return;
    };
    let response = match outcome {
        Ok(value) => Response::returning(value),
        Err(reason) => {
            debug!(%message_id, %method, %reason, "invocation failed");
            Response::failed(reason)
        }
    };
    reply(connection, Envelope::new(own_id, message_id, response)).await;
}

/// Runs the recipient method on a blocking thread.
async fn invoke(portal: &PortalInner, invocation: Invocation) -> Result<Option<Payload>, String> {
    let recipient = Arc::clone(portal.recipient());
    let method = invocation.method().to_string();
    match WorkerPool::run_blocking(move || {
        recipient.invoke_method(invocation.method(), invocation.arguments())
    })
    .await
    {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) => {
            error!(%method, error = %err, "recipient panicked");
            Err(format!("method '{method}' panicked"))
        }
    }
}

async fn handle_initialization(portal: &PortalInner, source: NodeId, assigned: NodeId) {
    if !portal.assign_identity(assigned) {
        warn!(%source, current = ?portal.node_id(), %assigned, "ignoring second initialization");
        return;
    }
    info!(node_id = %assigned, %source, "identity assigned");

    let recipient = Arc::clone(portal.recipient());
    if let Err(err) = WorkerPool::run_blocking(move || recipient.set_node_id(assigned)).await {
        error!(node_id = %assigned, error = %err, "recipient panicked while taking its identity");
    }
}

async fn handle_identification(
    portal: &PortalInner,
    connection: &Connection,
    message_id: MessageId,
    identification: ResourceIdentification,
) {
    let Some(own_id) = portal.node_id() else {
        warn!(%message_id, "cannot identify resources before this node has an identity");
        return;
    };

    let recipient = Arc::clone(portal.recipient());
    let requested = identification.resource_name().to_string();
    let identity =
        match WorkerPool::run_blocking(move || recipient.identify(own_id, &requested)).await {
            Ok(identity) => identity,
            Err(err) => {
                error!(%message_id, error = %err, "resource identification panicked");
                return;
            }
        };

    let answer = match identity {
        Some(identity) => {
            debug!(
                %message_id,
                resource = identification.resource_name(),
                node = %identity.node_id,
                object = %identity.object_name,
                "answering resource identification"
            );
            identification.answer(identity)
        }
        None => {
            debug!(%message_id, resource = identification.resource_name(), "unknown resource");
            identification.unresolved()
        }
    };
    reply(connection, Envelope::new(own_id, message_id, answer)).await;
}

async fn reply(connection: &Connection, envelope: Envelope) {
    if let Err(err) = connection.send(&envelope).await {
        error!(
            connection = connection.id(),
            message_id = %envelope.message_id(),
            error = %err,
            "failed to send reply"
        );
    }
}
