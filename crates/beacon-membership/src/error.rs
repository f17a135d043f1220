//! Error types for the membership lifecycle.

use std::time::Duration;

use thiserror::Error;

use beacon_core::ConfigError;
use beacon_health::HealthError;
use beacon_store::StoreError;

pub type BundleResult<T> = Result<T, BundleError>;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle already started")]
    AlreadyStarted,

    #[error("no coordination store configured")]
    MissingStore,

    #[error("probe name is reserved for a built-in probe: {0}")]
    ReservedProbe(String),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
