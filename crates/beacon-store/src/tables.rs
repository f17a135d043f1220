//! redb table definitions for the coordination store.
//!
//! Node paths are stored verbatim (`/namespace/service/host:port`), so a
//! namespace's children are a contiguous key range.

use redb::TableDefinition;

/// Store nodes keyed by absolute path.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Live sessions keyed by session id.
pub const SESSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("sessions");
