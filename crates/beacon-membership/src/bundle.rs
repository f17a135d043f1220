//! Discovery bundle: the lifecycle a host application embeds.
//!
//! Build it from a [`BeaconConfig`] and a store, register probes, call
//! [`DiscoveryBundle::start`] once the application is up and
//! [`DiscoveryBundle::shutdown`] on the way down.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use beacon_core::{BeaconConfig, NodeMetadata};
use beacon_discovery::{DiscoveryClient, DiscoverySettings};
use beacon_health::{
    AggregateVerdict, AggregatorSettings, BoxFuture, HealthAggregator, HealthProbe, InitialDelay,
    ProbeRegistry, ProbeReport, ServerStatus, VerdictCallback,
};
use beacon_store::CoordinationStore;

use crate::error::{BundleError, BundleResult};
use crate::publisher::{MembershipPublisher, PublisherState, PublisherStats};
use crate::retry::RetryPolicy;
use crate::rotation::RotationGate;

/// Builder for [`DiscoveryBundle`].
pub struct DiscoveryBundleBuilder {
    config: BeaconConfig,
    store: Option<Arc<dyn CoordinationStore>>,
    host: Option<String>,
    port: Option<u16>,
}

impl DiscoveryBundleBuilder {
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Advertise this host instead of `node.host`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Advertise this port instead of `node.port`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn build(self) -> BundleResult<DiscoveryBundle> {
        let mut config = self.config;
        if let Some(host) = self.host {
            config.node.host = host;
        }
        if let Some(port) = self.port {
            config.node.port = port;
        }
        config.validate()?;
        let store = self.store.ok_or(BundleError::MissingStore)?;

        let metadata = config.node_metadata();
        let publisher = MembershipPublisher::new(
            store.clone(),
            &config.service.namespace,
            &config.service.name,
            metadata.clone(),
            RetryPolicy::from_config(&config.store),
        );
        let discovery = DiscoveryClient::new(
            store.clone(),
            config.service.namespace.clone(),
            DiscoverySettings::from_config(&config.discovery, &config.store),
        );

        Ok(DiscoveryBundle {
            rotation: RotationGate::new(config.rotation.initial_status),
            server_status: ServerStatus::new(),
            registry: Mutex::new(Some(ProbeRegistry::new())),
            aggregator: OnceLock::new(),
            publisher: Arc::new(publisher),
            discovery: Arc::new(discovery),
            store,
            metadata,
            config,
        })
    }
}

/// Discovery cache state for one watched service.
#[derive(Debug, Clone, Serialize)]
pub struct WatchedService {
    pub service: String,
    pub nodes: usize,
    /// Cache rebuilds applied so far.
    pub generation: u64,
}

/// Operational snapshot, served by the admin endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BundleStatus {
    pub service: String,
    pub node: String,
    pub path: String,
    pub in_rotation: bool,
    pub verdict: Option<AggregateVerdict>,
    pub probes: Vec<ProbeReport>,
    pub publisher: PublisherState,
    pub stats: PublisherStats,
    pub watched: Vec<WatchedService>,
}

pub struct DiscoveryBundle {
    config: BeaconConfig,
    metadata: NodeMetadata,
    store: Arc<dyn CoordinationStore>,
    rotation: RotationGate,
    server_status: ServerStatus,
    /// Taken by `start`.
    registry: Mutex<Option<ProbeRegistry>>,
    aggregator: OnceLock<HealthAggregator>,
    publisher: Arc<MembershipPublisher>,
    discovery: Arc<DiscoveryClient>,
}

impl DiscoveryBundle {
    pub fn builder(config: BeaconConfig) -> DiscoveryBundleBuilder {
        DiscoveryBundleBuilder {
            config,
            store: None,
            host: None,
            port: None,
        }
    }

    /// Register a health probe. Only allowed before `start`.
    ///
    /// The built-in probe names are reserved whether or not the built-in
    /// probes are enabled.
    pub fn register_probe(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> BundleResult<()> {
        let name = name.into();
        if name == ServerStatus::PROBE_NAME || name == InitialDelay::PROBE_NAME {
            return Err(BundleError::ReservedProbe(name));
        }
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let registry = registry.as_mut().ok_or(BundleError::AlreadyStarted)?;
        registry.register(name, probe)?;
        Ok(())
    }

    /// Begin polling and publishing, and start watching this service and
    /// every service in `discovery.services`.
    ///
    /// A failure before polling begins leaves the bundle unstarted.
    pub async fn start(&self) -> BundleResult<()> {
        let registry = {
            let mut slot = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            let user = slot.as_ref().ok_or(BundleError::AlreadyStarted)?;
            let merged = self.with_builtin_probes(user)?;
            *slot = None;
            merged
        };
        let probes = registry.len();

        let publisher = self.publisher.clone();
        let gate = self.rotation.clone();
        let callback: VerdictCallback = Arc::new(move |verdict: AggregateVerdict| -> BoxFuture {
            let publisher = publisher.clone();
            let gate = gate.clone();
            Box::pin(async move {
                publisher.apply(gate.target(verdict.overall_healthy)).await;
            })
        });

        let aggregator = HealthAggregator::with_callback(
            registry,
            AggregatorSettings::from_config(&self.config.health),
            callback,
        );
        aggregator.start();
        if self.aggregator.set(aggregator).is_err() {
            return Err(BundleError::AlreadyStarted);
        }

        self.discovery.watch_service(&self.config.service.name).await;
        for service in &self.config.discovery.services {
            self.discovery.watch_service(service).await;
        }

        info!(
            service = %self.config.service.name,
            node = %self.metadata.node_id(),
            probes,
            in_rotation = self.rotation.is_in_rotation(),
            "discovery bundle started"
        );
        Ok(())
    }

    /// Built-in probes go first so they decide the verdict reason.
    fn with_builtin_probes(&self, user: &ProbeRegistry) -> BundleResult<ProbeRegistry> {
        let health = &self.config.health;
        let mut registry = ProbeRegistry::new();
        if health.wait_for_server_start {
            registry.register(ServerStatus::PROBE_NAME, Arc::new(self.server_status.clone()))?;
        }
        if health.initial_delay_secs > 0 {
            let delay = InitialDelay::new(std::time::Duration::from_secs(health.initial_delay_secs));
            registry.register(InitialDelay::PROBE_NAME, Arc::new(delay))?;
        }
        for (name, probe) in user.snapshot() {
            registry.register(name, probe)?;
        }
        Ok(registry)
    }

    /// Stop polling, withdraw and release the store session within
    /// `store.shutdown_timeout_ms`, then close discovery. Always returns.
    pub async fn shutdown(&self) -> BundleResult<()> {
        if let Some(aggregator) = self.aggregator.get() {
            aggregator.stop().await;
        }
        let stopped = self
            .publisher
            .stop(self.config.store.shutdown_timeout())
            .await;
        self.discovery.close();

        match &stopped {
            Ok(()) => info!(service = %self.config.service.name, "discovery bundle stopped"),
            Err(e) => warn!(service = %self.config.service.name, error = %e, "discovery bundle stopped with errors"),
        }
        stopped
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    pub fn service_name(&self) -> &str {
        &self.config.service.name
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn rotation(&self) -> &RotationGate {
        &self.rotation
    }

    pub fn server_status(&self) -> &ServerStatus {
        &self.server_status
    }

    pub fn publisher(&self) -> &Arc<MembershipPublisher> {
        &self.publisher
    }

    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    pub fn aggregator(&self) -> Option<&HealthAggregator> {
        self.aggregator.get()
    }

    pub fn is_started(&self) -> bool {
        self.aggregator.get().is_some()
    }

    pub async fn status(&self) -> BundleStatus {
        let (verdict, probes) = match self.aggregator.get() {
            Some(aggregator) => (
                Some(aggregator.current_verdict().await),
                aggregator.reports().await,
            ),
            None => (None, Vec::new()),
        };
        let watched = self
            .discovery
            .services()
            .into_iter()
            .filter_map(|service| {
                let cache = self.discovery.cache(&service)?;
                Some(WatchedService {
                    service,
                    nodes: cache.len(),
                    generation: cache.generation(),
                })
            })
            .collect();
        BundleStatus {
            service: self.config.service.name.clone(),
            node: self.metadata.node_id(),
            path: self.publisher.path().to_string(),
            in_rotation: self.rotation.is_in_rotation(),
            verdict,
            probes,
            publisher: self.publisher.state().await,
            stats: self.publisher.stats(),
            watched,
        }
    }
}
