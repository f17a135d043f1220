//! End-to-end membership scenarios: bundle, store and an independent
//! discovery client, on paused time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

use beacon_core::{BeaconConfig, NodeHealth, service_path};
use beacon_discovery::{DiscoveryClient, DiscoverySettings};
use beacon_health::{HealthProbe, HealthStatus, ProbeError};
use beacon_membership::{DiscoveryBundle, PublisherState};
use beacon_store::{CoordinationStore, Ensemble};

const SERVICE: &str = "TestService";

/// Returns queued statuses, then repeats the last one.
struct Scripted {
    script: Mutex<VecDeque<HealthStatus>>,
    last: Mutex<HealthStatus>,
}

impl Scripted {
    fn new(statuses: &[HealthStatus]) -> Arc<dyn HealthProbe> {
        Arc::new(Self {
            script: Mutex::new(statuses.iter().copied().collect()),
            last: Mutex::new(HealthStatus::Unhealthy),
        })
    }
}

#[async_trait]
impl HealthProbe for Scripted {
    async fn check(&self) -> Result<HealthStatus, ProbeError> {
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(*last)
    }
}

struct Harness {
    ensemble: Ensemble,
    bundle: Arc<DiscoveryBundle>,
    observer: DiscoveryClient,
    started_at: Instant,
    _reaper: JoinHandle<()>,
}

impl Harness {
    async fn start(probes: Vec<(&str, Arc<dyn HealthProbe>)>) -> Self {
        let ensemble = Ensemble::open_in_memory().unwrap();

        let mut config = BeaconConfig::scaffold(SERVICE, "TestHost", 8021);
        config.service.namespace = "test".to_string();
        config.service.environment = "testing".to_string();
        config.health.check_interval_secs = 2;
        config.health.staleness_factor = 2;
        config.store.connection_retry_interval_ms = 50;
        config.store.max_backoff_ms = 200;
        ensemble.set_session_timeout(config.store.session_timeout());
        let reaper = ensemble.spawn_reaper();

        let store: Arc<dyn CoordinationStore> = Arc::new(ensemble.connect().unwrap());
        let bundle = DiscoveryBundle::builder(config).store(store).build().unwrap();
        for (name, probe) in probes {
            bundle.register_probe(name, probe).unwrap();
        }

        let observer_store: Arc<dyn CoordinationStore> = Arc::new(ensemble.connect().unwrap());
        let observer = DiscoveryClient::new(observer_store, "test", DiscoverySettings::default());
        observer.watch_service(SERVICE).await;

        let started_at = Instant::now();
        bundle.start().await.unwrap();

        Self {
            ensemble,
            bundle: Arc::new(bundle),
            observer,
            started_at,
            _reaper: reaper,
        }
    }

    fn record_count(&self) -> usize {
        self.ensemble
            .child_count(&service_path("test", SERVICE))
            .unwrap()
    }

    fn discoverable(&self) -> bool {
        self.observer.get_node(SERVICE).is_some()
    }

    /// Poll `condition` in small steps until `deadline` (relative to start).
    async fn eventually(&self, deadline: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = self.started_at + deadline;
        while Instant::now() <= deadline {
            if condition(self) {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    async fn at(&self, offset: Duration) {
        sleep_until(self.started_at + offset).await;
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[tokio::test(start_paused = true)]
async fn healthy_twice_then_unhealthy_is_withdrawn() {
    use HealthStatus::{Healthy, Unhealthy};
    let h = Harness::start(vec![("app", Scripted::new(&[Healthy, Healthy, Unhealthy]))]).await;

    // Discoverable after the first publish.
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);
    let node = h.observer.get_node(SERVICE).unwrap();
    assert_eq!(node.endpoint(), "TestHost:8021");
    assert_eq!(node.metadata.environment, "testing");
    assert_eq!(node.health, NodeHealth::Healthy);

    // Still there after the second healthy reading.
    h.at(secs(3)).await;
    assert!(h.discoverable());

    // Last healthy reading at t=2, window 4s: gone by t=6 at the latest.
    assert!(h.eventually(secs(6), |h| !h.discoverable()).await);
    assert_eq!(h.record_count(), 0);

    h.at(secs(11)).await;
    assert!(!h.discoverable());
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Withdrawn);

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_probes_publishes_and_stays() {
    let h = Harness::start(vec![]).await;

    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);
    h.at(secs(20)).await;
    assert!(h.discoverable());
    assert_eq!(h.record_count(), 1);

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_healthy_cycles_keep_one_record() {
    let h = Harness::start(vec![(
        "app",
        Arc::new(|| HealthStatus::Healthy) as Arc<dyn HealthProbe>,
    )])
    .await;

    h.at(secs(21)).await;
    assert_eq!(h.record_count(), 1);
    assert_eq!(h.observer.list_nodes(SERVICE).len(), 1);

    let stats = h.bundle.publisher().stats();
    assert_eq!(stats.publishes, 1);
    assert_eq!(stats.refreshes, 10);
    assert_eq!(stats.store_failures, 0);

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rotation_overrides_health() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);

    // Out of rotation: withdrawn on the next cycle.
    h.bundle.rotation().set_in_rotation(false);
    assert!(h.eventually(secs(3), |h| !h.discoverable()).await);
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Withdrawn);

    // Back in rotation without any health change.
    h.bundle.rotation().set_in_rotation(true);
    assert!(h.eventually(secs(5), Harness::discoverable).await);
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Published);

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn session_expiry_is_repaired_on_next_cycle() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);

    h.at(secs(1)).await;
    let session = h.bundle.store().session().unwrap();
    h.ensemble.expire_session(session).unwrap();
    assert_eq!(h.record_count(), 0);
    assert!(h.eventually(Duration::from_millis(1500), |h| !h.discoverable()).await);

    // The t=2 cycle re-creates the record under a new session.
    assert!(h.eventually(secs(3), Harness::discoverable).await);
    assert_eq!(h.record_count(), 1);
    assert_ne!(h.bundle.store().session().unwrap(), session);

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn store_outage_converges_after_recovery() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);

    h.ensemble.set_available(false);
    h.at(secs(5)).await;
    // The observer keeps its last known view during the outage.
    assert!(h.discoverable());
    assert!(h.bundle.publisher().stats().store_failures > 0);
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Published);

    h.ensemble.set_available(true);
    h.at(secs(7)).await;
    assert_eq!(h.record_count(), 1);
    assert!(h.discoverable());

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_withdraws_and_releases_session() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);
    let session = h.bundle.store().session().unwrap();

    h.bundle.shutdown().await.unwrap();
    assert_eq!(h.record_count(), 0);
    assert!(!h.ensemble.live_sessions().unwrap().contains(&session));
    assert!(h.eventually(secs(2), |h| !h.discoverable()).await);

    // No further verdicts reach the store.
    h.at(secs(10)).await;
    assert_eq!(h.record_count(), 0);
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn environment_filter_hides_other_environments() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);

    let store: Arc<dyn CoordinationStore> = Arc::new(h.ensemble.connect().unwrap());
    let mut settings = DiscoverySettings::default();
    settings.filter.environment = Some("production".to_string());
    let prod_reader = DiscoveryClient::new(store, "test", settings);
    prod_reader.watch_service(SERVICE).await;

    assert!(prod_reader.get_node(SERVICE).is_none());
    assert!(h.discoverable());

    h.bundle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_shutdown_is_cleaned_up_by_session_timeout() {
    let h = Harness::start(vec![]).await;
    assert!(h.eventually(Duration::from_millis(500), Harness::discoverable).await);
    let session = h.bundle.store().session().unwrap();

    h.ensemble.set_available(false);
    assert!(h.bundle.shutdown().await.is_err());
    h.ensemble.set_available(true);
    assert_eq!(h.record_count(), 1);
    assert_eq!(h.bundle.publisher().state().await, PublisherState::Stopped);

    // Default session timeout is 40s; the reaper takes the record with it.
    assert!(h.eventually(secs(60), |h| h.record_count() == 0).await);
    assert!(!h.ensemble.live_sessions().unwrap().contains(&session));
    assert!(h.eventually(secs(61), |h| !h.discoverable()).await);
}
