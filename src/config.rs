//! Portal configuration.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    connection::ConnectionOptions,
    framing::DEFAULT_MAX_FRAME_LEN,
    id::NodeId,
    pool::DEFAULT_WORKER_THREADS,
};

/// Default directory host
pub const DEFAULT_DIRECTORY_HOST: &str = "127.0.0.1";

/// Default directory port
pub const DEFAULT_DIRECTORY_PORT: u16 = 7400;

/// Default first identity handed out by a directory
pub const DEFAULT_FIRST_ISSUED_ID: u64 = 1;

/// Default deadline for a synchronous call, in seconds
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default wait for the directory to assign an identity, in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Configuration for a [`Portal`](crate::Portal).
///
/// Derives `Deserialize` with defaults for every field, so it can be loaded from any serde format
/// with only the interesting fields present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Host the directory listens on
    pub directory_host: String,
    /// Port the directory listens on
    pub directory_port: u16,
    /// Well-known identity of the directory
    pub directory_node_id: NodeId,
    /// Resource name to directory lookup key. Unmapped names are looked up verbatim.
    pub resources: HashMap<String, String>,
    /// Identity this node starts with, if it is not assigned one by the directory
    pub node_id: Option<NodeId>,
    /// First identity handed out when this node acts as the directory
    pub first_issued_id: NodeId,
    /// Maximum number of envelopes handled concurrently
    pub worker_threads: usize,
    /// Maximum frame body length, in bytes
    pub max_frame_len: usize,
    /// Deadline for synchronous calls. `None` waits until the connection closes.
    pub call_timeout: Option<Duration>,
    /// How long to wait for the directory's Initialization after connecting
    pub handshake_timeout: Duration,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            directory_host: DEFAULT_DIRECTORY_HOST.to_string(),
            directory_port: DEFAULT_DIRECTORY_PORT,
            directory_node_id: NodeId::DIRECTORY,
            resources: HashMap::new(),
            node_id: None,
            first_issued_id: NodeId::new(DEFAULT_FIRST_ISSUED_ID),
            worker_threads: DEFAULT_WORKER_THREADS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            call_timeout: Some(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        }
    }
}

impl PortalConfig {
    /// Points the node at a directory.
    pub fn with_directory(mut self, host: impl Into<String>, port: u16) -> Self {
        self.directory_host = host.into();
        self.directory_port = port;
        self
    }

    /// Starts the node with a fixed identity.
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Maps a resource name onto the key the directory knows it by.
    pub fn with_resource(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.resources.insert(name.into(), key.into());
        self
    }

    /// Sets the deadline for synchronous calls.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The key the directory is asked for when resolving `resource`.
    pub fn lookup_key<'a>(&'a self, resource: &'a str) -> &'a str {
        self.resources
            .get(resource)
            .map(String::as_str)
            .unwrap_or(resource)
    }

    /// The directory's `host:port`.
    pub fn directory_address(&self) -> String {
        format!("{}:{}", self.directory_host, self.directory_port)
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_frame_len: self.max_frame_len,
            call_timeout: self.call_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_resources_are_looked_up_verbatim() {
        let config = PortalConfig::default().with_resource("catalog", "catalog-v2");
        assert_eq!(config.lookup_key("catalog"), "catalog-v2");
        assert_eq!(config.lookup_key("orders"), "orders");
    }

    #[test]
    fn missing_fields_take_their_defaults() {
        #[derive(Serialize)]
        struct Partial {
            directory_port: u16,
        }

        let bytes = rmp_serde::to_vec_named(&Partial {
            directory_port: 9000,
        })
        .unwrap();
        let config: PortalConfig = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(config.directory_port, 9000);
        assert_eq!(config.directory_host, DEFAULT_DIRECTORY_HOST);
        assert_eq!(config.directory_node_id, NodeId::DIRECTORY);
        assert_eq!(config.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.directory_address(), "127.0.0.1:9000");
    }
}
