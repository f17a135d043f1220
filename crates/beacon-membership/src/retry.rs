//! Bounded retry for store side effects.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use beacon_core::StoreConfig;
use beacon_store::{StoreError, StoreResult};

/// Per-attempt timeout plus doubling backoff between attempts, capped.
///
/// Only connectivity errors are retried; protocol outcomes such as
/// `NoNode` return immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_interval: Duration,
    pub max_backoff: Duration,
    pub operation_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_interval: config.retry_interval(),
            max_backoff: config.max_backoff(),
            operation_timeout: config.operation_timeout(),
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut backoff = self.base_interval;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.operation_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(operation.to_string())),
            };

            match result {
                Err(e) if e.is_connectivity() && attempt < self.attempts => {
                    debug!(
                        %operation,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "store operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}
