//! beacon-store: the coordination store Beacon registers into.
//!
//! [`CoordinationStore`] is the interface the publisher and the discovery
//! client program against: hierarchical paths, ephemeral nodes bound to a
//! client session, and per-namespace change notification.
//!
//! The bundled implementation is an [`Ensemble`] (the shared server side,
//! backed by [redb](https://docs.rs/redb)) plus one [`StoreClient`] per
//! participant holding its own session.
//!
//! # Architecture
//!
//! ```text
//! Ensemble (Clone, Arc-backed)
//!   ├── redb: nodes table (path → StoredNode JSON)
//!   ├── redb: sessions table (id → SessionInfo JSON)
//!   └── watchers: namespace → watch::Sender<revision>
//!
//! StoreClient (impl CoordinationStore)
//!   ├── current session (re-established after expiry)
//!   └── session events (watch::Sender<SessionEvent>)
//! ```
//!
//! Ephemeral nodes disappear with their session, whether it is closed or
//! times out for lack of client operations.
//! Sessions never survive a restart of an on-disk ensemble.

pub mod client;
pub mod ensemble;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use client::StoreClient;
pub use ensemble::Ensemble;
pub use error::{StoreError, StoreResult};
pub use store::CoordinationStore;
pub use types::*;
