//! The interface Beacon programs against.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::StoreResult;
use crate::types::{ChildNode, CreateMode, SessionEvent, SessionToken};

/// A hierarchical key-value store with session-bound ephemeral nodes and
/// change notification.
///
/// Every operation may fail with a connectivity error
/// ([`StoreError::is_connectivity`](crate::StoreError::is_connectivity));
/// callers own retry and timeout policy.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node. Fails with `NodeExists` if the path is taken.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> StoreResult<()>;

    /// Replace a node's payload. Fails with `NoNode` if absent.
    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Delete a node. Fails with `NoNode` if absent.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Direct children of `namespace`, ordered by name.
    async fn get_children(&self, namespace: &str) -> StoreResult<Vec<ChildNode>>;

    /// Subscribe to changes among the direct children of `namespace`.
    ///
    /// The value is a revision counter; every create, update or delete of a
    /// child (including store-driven removal of ephemeral nodes) bumps it.
    async fn watch(&self, namespace: &str) -> StoreResult<watch::Receiver<u64>>;

    /// Session currently held by this client.
    fn session(&self) -> Option<SessionToken>;

    fn session_events(&self) -> watch::Receiver<SessionEvent>;

    /// End the session, removing its ephemeral nodes. The client is closed
    /// even when the store is unreachable; the session then times out on
    /// the store side.
    async fn close(&self) -> StoreResult<()>;
}
