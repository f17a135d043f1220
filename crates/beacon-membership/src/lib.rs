//! beacon-membership: turns health verdicts into registry membership.
//!
//! The [`MembershipPublisher`] owns this node's single registration record
//! and drives it through create, refresh and delete. The [`RotationGate`]
//! lets an operator force a healthy node out of rotation. The
//! [`DiscoveryBundle`] wires probes, aggregator, gate, publisher and a
//! discovery client into one start/shutdown lifecycle.
//!
//! # Control flow
//!
//! ```text
//! HealthAggregator ──verdict──┐
//!                             ├─ target = healthy && in_rotation
//! RotationGate ───────────────┘
//!                                   │
//!                       MembershipPublisher.apply(target)
//!                                   │
//!                          CoordinationStore
//! ```

pub mod bundle;
pub mod error;
pub mod publisher;
pub mod retry;
pub mod rotation;

pub use bundle::{BundleStatus, DiscoveryBundle, DiscoveryBundleBuilder, WatchedService};
pub use error::{BundleError, BundleResult};
pub use publisher::{MembershipPublisher, PublisherState, PublisherStats};
pub use retry::RetryPolicy;
pub use rotation::RotationGate;
