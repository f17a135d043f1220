//! The probe interface.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProbeError;

/// Outcome of one successful probe invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

impl From<bool> for HealthStatus {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Something the aggregator can poll.
///
/// Implementations should return promptly; the aggregator enforces its
/// execution budget only at await points.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<HealthStatus, ProbeError>;
}

/// Plain closures are probes.
#[async_trait]
impl<F> HealthProbe for F
where
    F: Fn() -> HealthStatus + Send + Sync,
{
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        Ok(self())
    }
}
