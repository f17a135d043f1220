//! beacon-discovery: the read side of Beacon.
//!
//! A [`DiscoveryClient`] watches service namespaces in the coordination
//! store and keeps one [`DiscoveryCache`] per watched service. Queries
//! are answered from the cache and never touch the store.
//!
//! # Architecture
//!
//! ```text
//! DiscoveryClient
//!   └── per watched service
//!       ├── DiscoveryCache (ArcSwap snapshot + round-robin counter)
//!       └── background task
//!           ├── store.watch(namespace) → rebuild on every notification
//!           ├── periodic resync
//!           └── backoff on store failure (last-known view kept)
//! ```

pub mod cache;
pub mod client;

pub use cache::{DiscoveryCache, NodeFilter, SyncStats, decode_children};
pub use client::{DiscoveryClient, DiscoverySettings};
