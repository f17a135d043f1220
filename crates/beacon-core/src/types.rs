//! Shared types used across Beacon crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// What a node advertises about itself. Supplied once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub host: String,
    pub port: u16,
    pub environment: String,
    /// Opaque shard payload, passed through to readers untouched.
    #[serde(default)]
    pub shard: BTreeMap<String, String>,
}

impl NodeMetadata {
    pub fn new(host: impl Into<String>, port: u16, environment: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            environment: environment.into(),
            shard: BTreeMap::new(),
        }
    }

    /// Attach a shard key/value pair.
    pub fn with_shard(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.shard.insert(key.into(), value.into());
        self
    }

    /// Node identity within a service: `host:port`.
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Health flag carried in the registry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
}

/// The record written at a node's registry path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    pub metadata: NodeMetadata,
    pub health: NodeHealth,
    /// Unix timestamp (milliseconds) of the last publish or refresh.
    pub last_updated_ms: u64,
}

impl ServiceNode {
    /// A healthy record stamped with the current wall-clock time.
    pub fn healthy(metadata: NodeMetadata) -> Self {
        Self {
            metadata,
            health: NodeHealth::Healthy,
            last_updated_ms: epoch_millis(),
        }
    }

    pub fn host(&self) -> &str {
        &self.metadata.host
    }

    pub fn port(&self) -> u16 {
        self.metadata.port
    }

    /// `host:port`, as used by callers that want to dial the node.
    pub fn endpoint(&self) -> String {
        self.metadata.node_id()
    }

    /// Age of the record relative to `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_updated_ms)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

// ── Registry layout ───────────────────────────────────────────────

/// Namespace under which all nodes of a service are registered:
/// `/{namespace}/{service}`.
pub fn service_path(namespace: &str, service: &str) -> String {
    format!("/{namespace}/{service}")
}

/// Registry path of a single node: `/{namespace}/{service}/{host}:{port}`.
pub fn node_path(namespace: &str, service: &str, metadata: &NodeMetadata) -> String {
    format!("{}/{}", service_path(namespace, service), metadata.node_id())
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
