//! Probes installed by the bundle itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::error::ProbeError;
use crate::probe::{HealthProbe, HealthStatus};

/// `server-startup`: unhealthy until the host application reports that
/// its server is accepting traffic.
#[derive(Debug, Clone, Default)]
pub struct ServerStatus {
    started: Arc<AtomicBool>,
}

impl ServerStatus {
    pub const PROBE_NAME: &'static str = "server-startup";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!("server marked started");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ServerStatus {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        Ok(self.is_started().into())
    }
}

/// `initial-delay`: unhealthy until a fixed delay has elapsed.
#[derive(Debug, Clone)]
pub struct InitialDelay {
    ready_at: Instant,
}

impl InitialDelay {
    pub const PROBE_NAME: &'static str = "initial-delay";

    /// Delay counted from now.
    pub fn new(delay: Duration) -> Self {
        Self {
            ready_at: Instant::now() + delay,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.ready_at.saturating_duration_since(Instant::now())
    }
}

#[async_trait]
impl HealthProbe for InitialDelay {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        Ok((Instant::now() >= self.ready_at).into())
    }
}
