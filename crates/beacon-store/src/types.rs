//! Domain types for the coordination store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a client session. Ephemeral nodes are owned by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionToken(pub u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until explicitly deleted.
    Persistent,
    /// Removed when the creating session ends.
    Ephemeral,
}

/// Session lifecycle as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session is established. A new token after an expiry means
    /// every ephemeral node of the old session is gone.
    Connected(SessionToken),
    /// The client was closed and holds no session.
    Closed,
}

/// A direct child of a namespace, with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    /// Last path segment.
    pub name: String,
    pub data: Vec<u8>,
}

/// Persisted form of a store node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNode {
    pub data: Vec<u8>,
    /// Owning session for ephemeral nodes.
    pub owner: Option<u64>,
    /// Incremented on every `set_data`.
    pub version: u64,
    pub created_at_ms: u64,
    pub modified_at_ms: u64,
}

/// Persisted form of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u64,
    pub created_at_ms: u64,
}

/// Parent namespace of a path (`/a/b/c` → `/a/b`, `/a` → `/`).
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Absolute, no trailing slash, no empty segments.
pub fn is_valid_path(path: &str) -> bool {
    path.len() > 1
        && path.starts_with('/')
        && !path.ends_with('/')
        && !path[1..].split('/').any(str::is_empty)
}
