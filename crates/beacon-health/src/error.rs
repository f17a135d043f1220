//! Error types for health aggregation.

use std::time::Duration;

use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("probe already registered: {0}")]
    DuplicateProbe(String),

    #[error("probe name must not be empty")]
    EmptyName,
}

/// Why a single probe invocation did not produce a status.
///
/// Never escapes the aggregator; the probe is recorded `Unhealthy`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe panicked: {0}")]
    Panicked(String),
}

impl ProbeError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ProbeError::Failed(reason.into())
    }
}
