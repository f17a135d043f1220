//! beacon-health: health aggregation for Beacon.
//!
//! Probes are registered by name into a [`ProbeRegistry`] during startup.
//! The [`HealthAggregator`] then polls every probe on a fixed interval and
//! folds the latest observations into a single [`AggregateVerdict`].
//!
//! # Architecture
//!
//! ```text
//! HealthAggregator
//!   ├── Background polling task (interval, watch shutdown)
//!   │   ├── probes run through a bounded stream, each under a timeout
//!   │   ├── observations stored together once the cycle completes
//!   │   └── verdict computed with staleness awareness
//!   └── Optional VerdictCallback (the membership publisher)
//! ```
//!
//! # Verdict rules
//!
//! A node is healthy when every probe's latest observation is `Healthy`
//! and no older than the staleness window. A probe never observed counts
//! as stale. With no probes registered the verdict is healthy.
//! Errors, panics and timeouts inside a probe downgrade that probe only.

pub mod aggregator;
pub mod builtin;
pub mod error;
pub mod probe;
pub mod registry;

pub use aggregator::{
    AggregateVerdict, AggregatorSettings, BoxFuture, HealthAggregator, ProbeObservation, ProbeReport,
    VerdictCallback, VerdictReason,
};
pub use builtin::{InitialDelay, ServerStatus};
pub use error::{HealthError, HealthResult, ProbeError};
pub use probe::{HealthProbe, HealthStatus};
pub use registry::ProbeRegistry;
