//! Error types for the coordination store.

use thiserror::Error;

/// Result type alias for coordination store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection to store lost: {0}")]
    ConnectionLost(String),

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("client closed")]
    Closed,

    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StoreError {
    /// Transient failures worth retrying with backoff.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::SessionExpired(_) | StoreError::Timeout(_)
        )
    }
}
