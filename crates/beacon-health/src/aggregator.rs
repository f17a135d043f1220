//! Health aggregator: the periodic polling loop and its verdict.
//!
//! Each cycle invokes every registered probe under the execution budget,
//! records one observation per probe stamped with the monotonic time of
//! the invocation, and only then recomputes the aggregate verdict. The
//! verdict is handed to the optional [`VerdictCallback`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use beacon_core::HealthConfig;

use crate::error::ProbeError;
use crate::probe::{HealthProbe, HealthStatus};
use crate::registry::ProbeRegistry;

/// Callback invoked with the verdict of every completed cycle.
pub type VerdictCallback = Arc<dyn Fn(AggregateVerdict) -> BoxFuture + Send + Sync>;

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

// ── Verdicts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictReason {
    AllHealthy,
    ProbeFailed,
    ProbeStale,
}

/// The fold of all latest observations at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateVerdict {
    pub overall_healthy: bool,
    pub reason: VerdictReason,
    /// First offending probe in registration order.
    pub probe: Option<String>,
}

impl AggregateVerdict {
    pub fn all_healthy() -> Self {
        Self {
            overall_healthy: true,
            reason: VerdictReason::AllHealthy,
            probe: None,
        }
    }

    fn offending(reason: VerdictReason, probe: &str) -> Self {
        Self {
            overall_healthy: false,
            reason,
            probe: Some(probe.to_string()),
        }
    }
}

/// One probe's result for one cycle. Replaced by the next cycle's.
#[derive(Debug, Clone)]
pub struct ProbeObservation {
    pub probe: String,
    pub status: HealthStatus,
    pub observed_at: Instant,
    pub detail: Option<String>,
}

/// Wire-friendly view of a probe's latest observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub probe: String,
    pub status: Option<HealthStatus>,
    pub age_ms: Option<u64>,
    pub stale: bool,
    pub detail: Option<String>,
}

// ── Settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub check_interval: Duration,
    /// Observations strictly older than this are stale.
    pub staleness_window: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
}

impl AggregatorSettings {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            check_interval: config.check_interval(),
            staleness_window: config.staleness_window(),
            probe_timeout: config.probe_timeout(),
            max_concurrent_probes: config.max_concurrent_probes.max(1),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from_config(&HealthConfig::default())
    }
}

// ── Aggregator ─────────────────────────────────────────────────────

#[derive(Default)]
struct AggregatorState {
    observations: HashMap<String, ProbeObservation>,
    latest: Option<AggregateVerdict>,
    cycles: u64,
}

struct AggregatorInner {
    probes: Vec<(String, Arc<dyn HealthProbe>)>,
    settings: AggregatorSettings,
    state: RwLock<AggregatorState>,
    on_verdict: Option<VerdictCallback>,
}

/// Background polling task handle.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns all observations for one node.
pub struct HealthAggregator {
    inner: Arc<AggregatorInner>,
    slot: Mutex<Option<LoopSlot>>,
}

impl HealthAggregator {
    /// Build an aggregator over the probes registered so far.
    pub fn new(registry: ProbeRegistry, settings: AggregatorSettings) -> Self {
        Self::build(registry, settings, None)
    }

    /// Build an aggregator that reports every verdict to `callback`.
    pub fn with_callback(
        registry: ProbeRegistry,
        settings: AggregatorSettings,
        callback: VerdictCallback,
    ) -> Self {
        Self::build(registry, settings, Some(callback))
    }

    fn build(
        registry: ProbeRegistry,
        settings: AggregatorSettings,
        on_verdict: Option<VerdictCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                probes: registry.snapshot(),
                settings,
                state: RwLock::new(AggregatorState::default()),
                on_verdict,
            }),
            slot: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.inner.settings
    }

    pub fn probe_names(&self) -> Vec<String> {
        self.inner.probes.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Start the polling loop. The first cycle runs immediately.
    pub fn start(&self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_poll_loop(inner, shutdown_rx).await;
        });

        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = slot.replace(LoopSlot {
            handle,
            shutdown_tx,
        }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(
            probes = self.inner.probes.len(),
            interval_ms = self.inner.settings.check_interval.as_millis() as u64,
            window_ms = self.inner.settings.staleness_window.as_millis() as u64,
            "health aggregator started"
        );
    }

    /// Cancel the polling loop. No verdict is emitted once this returns.
    pub async fn stop(&self) {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            let _ = slot.handle.await;
            info!("health aggregator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|slot| !slot.handle.is_finished())
    }

    /// Run one cycle now and return its verdict. Does not invoke the callback.
    pub async fn run_cycle(&self) -> AggregateVerdict {
        self.inner.run_cycle().await
    }

    /// Verdict of the most recent completed cycle.
    pub async fn latest_verdict(&self) -> Option<AggregateVerdict> {
        self.inner.state.read().await.latest.clone()
    }

    /// Stored observations evaluated against the current time, so a
    /// stalled loop shows up as stale.
    pub async fn current_verdict(&self) -> AggregateVerdict {
        let state = self.inner.state.read().await;
        evaluate(
            &self.inner.probes,
            &state.observations,
            Instant::now(),
            self.inner.settings.staleness_window,
        )
    }

    pub async fn cycles(&self) -> u64 {
        self.inner.state.read().await.cycles
    }

    /// Latest observation per probe, in registration order.
    pub async fn reports(&self) -> Vec<ProbeReport> {
        let state = self.inner.state.read().await;
        let now = Instant::now();
        let window = self.inner.settings.staleness_window;
        self.inner
            .probes
            .iter()
            .map(|(name, _)| match state.observations.get(name) {
                Some(obs) => {
                    let age = now.saturating_duration_since(obs.observed_at);
                    ProbeReport {
                        probe: name.clone(),
                        status: Some(obs.status),
                        age_ms: Some(age.as_millis() as u64),
                        stale: age > window,
                        detail: obs.detail.clone(),
                    }
                }
                None => ProbeReport {
                    probe: name.clone(),
                    status: None,
                    age_ms: None,
                    stale: true,
                    detail: None,
                },
            })
            .collect()
    }
}

impl Drop for HealthAggregator {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slot.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }
}

impl AggregatorInner {
    async fn run_cycle(&self) -> AggregateVerdict {
        let timeout = self.settings.probe_timeout;
        let pending: Vec<_> = self
            .probes
            .iter()
            .cloned()
            .map(|(name, probe)| observe(name, probe, timeout))
            .collect();
        let observations: Vec<ProbeObservation> = stream::iter(pending)
            .buffered(self.settings.max_concurrent_probes.max(1))
            .collect()
            .await;

        let mut state = self.state.write().await;
        for obs in observations {
            if let Some(detail) = &obs.detail {
                debug!(probe = %obs.probe, %detail, "probe unhealthy");
            }
            state.observations.insert(obs.probe.clone(), obs);
        }

        let verdict = evaluate(
            &self.probes,
            &state.observations,
            Instant::now(),
            self.settings.staleness_window,
        );
        let changed = state
            .latest
            .as_ref()
            .is_none_or(|prev| prev.overall_healthy != verdict.overall_healthy);
        if changed {
            if verdict.overall_healthy {
                info!("node healthy");
            } else {
                warn!(reason = ?verdict.reason, probe = ?verdict.probe, "node unhealthy");
            }
        }
        state.latest = Some(verdict.clone());
        state.cycles += 1;
        verdict
    }
}

/// The polling loop for one aggregator.
async fn run_poll_loop(inner: Arc<AggregatorInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.settings.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("health poll loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let verdict = inner.run_cycle().await;
                if let Some(ref cb) = inner.on_verdict {
                    cb(verdict).await;
                }
            }
            _ = shutdown.changed() => {
                debug!("health poll loop shutting down");
                break;
            }
        }
    }
}

/// Invoke one probe under the execution budget. Never fails.
async fn observe(name: String, probe: Arc<dyn HealthProbe>, timeout: Duration) -> ProbeObservation {
    let observed_at = Instant::now();
    let outcome = tokio::time::timeout(timeout, AssertUnwindSafe(probe.check()).catch_unwind()).await;

    let (status, error) = match outcome {
        Ok(Ok(Ok(status))) => (status, None),
        Ok(Ok(Err(e))) => (HealthStatus::Unhealthy, Some(e)),
        Ok(Err(panic)) => (
            HealthStatus::Unhealthy,
            Some(ProbeError::Panicked(panic_message(panic.as_ref()))),
        ),
        Err(_) => (HealthStatus::Unhealthy, Some(ProbeError::Timeout(timeout))),
    };

    ProbeObservation {
        probe: name,
        status,
        observed_at,
        detail: error.map(|e| e.to_string()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fold the latest observations into a verdict.
///
/// Staleness is checked before status for each probe; the first offending
/// probe in registration order decides the reason.
fn evaluate(
    probes: &[(String, Arc<dyn HealthProbe>)],
    observations: &HashMap<String, ProbeObservation>,
    now: Instant,
    window: Duration,
) -> AggregateVerdict {
    for (name, _) in probes {
        let Some(obs) = observations.get(name) else {
            return AggregateVerdict::offending(VerdictReason::ProbeStale, name);
        };
        if now.saturating_duration_since(obs.observed_at) > window {
            return AggregateVerdict::offending(VerdictReason::ProbeStale, name);
        }
        if obs.status == HealthStatus::Unhealthy {
            return AggregateVerdict::offending(VerdictReason::ProbeFailed, name);
        }
    }
    AggregateVerdict::all_healthy()
}
