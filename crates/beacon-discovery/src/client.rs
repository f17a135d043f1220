//! Discovery client: keeps each watched service's cache in step with the store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use beacon_core::{DiscoveryConfig, ServiceNode, StoreConfig, epoch_millis, service_path};
use beacon_store::{CoordinationStore, StoreError, StoreResult};

use crate::cache::{DiscoveryCache, NodeFilter, decode_children};

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub filter: NodeFilter,
    pub resync_interval: Duration,
    pub operation_timeout: Duration,
    pub retry_interval: Duration,
    pub max_backoff: Duration,
}

impl DiscoverySettings {
    pub fn from_config(discovery: &DiscoveryConfig, store: &StoreConfig) -> Self {
        Self {
            filter: NodeFilter::from_config(discovery),
            resync_interval: discovery.resync_interval(),
            operation_timeout: store.operation_timeout(),
            retry_interval: store.retry_interval(),
            max_backoff: store.max_backoff(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default(), &StoreConfig::default())
    }
}

/// Per-service subscription.
struct WatchSlot {
    cache: Arc<DiscoveryCache>,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Answers node queries for watched services from local caches.
///
/// Queries for a service that is not watched return nothing.
pub struct DiscoveryClient {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    settings: DiscoverySettings,
    watches: RwLock<HashMap<String, WatchSlot>>,
}

impl DiscoveryClient {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: impl Into<String>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            settings,
            watches: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Start watching `service`, returning its cache.
    ///
    /// Does one sync before returning so the cache is warm when the store
    /// is reachable. Watching an already watched service is a no-op.
    pub async fn watch_service(&self, service: &str) -> Arc<DiscoveryCache> {
        if let Some(cache) = self.cache(service) {
            return cache;
        }

        let path = service_path(&self.namespace, service);
        let cache = Arc::new(DiscoveryCache::new());
        if let Err(e) = sync_once(self.store.as_ref(), &path, &cache, &self.settings).await {
            warn!(%path, error = %e, "initial discovery sync failed, will retry");
        }

        let mut watches = self.watches.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = watches.get(service) {
            return existing.cache.clone();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = self.store.clone();
        let settings = self.settings.clone();
        let task_cache = cache.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            run_watch_loop(store, task_path, task_cache, settings, shutdown_rx).await;
        });

        watches.insert(
            service.to_string(),
            WatchSlot {
                cache: cache.clone(),
                handle,
                shutdown_tx,
            },
        );
        info!(%path, nodes = cache.len(), "watching service");
        cache
    }

    /// One currently cached node of `service`, rotating across calls.
    pub fn get_node(&self, service: &str) -> Option<ServiceNode> {
        self.cache(service)?.pick()
    }

    /// Every currently cached node of `service`.
    pub fn list_nodes(&self, service: &str) -> Vec<ServiceNode> {
        self.cache(service)
            .map(|cache| cache.snapshot().as_ref().clone())
            .unwrap_or_default()
    }

    pub fn cache(&self, service: &str) -> Option<Arc<DiscoveryCache>> {
        let watches = self.watches.read().unwrap_or_else(PoisonError::into_inner);
        watches.get(service).map(|slot| slot.cache.clone())
    }

    /// Watched service names.
    pub fn services(&self) -> Vec<String> {
        let watches = self.watches.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = watches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every subscription.
    pub fn close(&self) {
        let mut watches = self.watches.write().unwrap_or_else(PoisonError::into_inner);
        for (service, slot) in watches.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%service, "stopped watching service");
        }
        info!("discovery client closed");
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        let watches = self.watches.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in watches.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }
}

/// Rebuild the cache from the store's current children.
async fn sync_once(
    store: &dyn CoordinationStore,
    path: &str,
    cache: &DiscoveryCache,
    settings: &DiscoverySettings,
) -> StoreResult<()> {
    let children = tokio::time::timeout(settings.operation_timeout, store.get_children(path))
        .await
        .map_err(|_| StoreError::Timeout(format!("get_children {path}")))??;
    let (nodes, stats) = decode_children(&children, &settings.filter, epoch_millis());
    cache.replace(nodes);
    debug!(
        %path,
        accepted = stats.accepted,
        filtered = stats.filtered,
        malformed = stats.malformed,
        "discovery cache rebuilt"
    );
    Ok(())
}

async fn subscribe(
    store: &dyn CoordinationStore,
    path: &str,
    timeout: Duration,
) -> StoreResult<watch::Receiver<u64>> {
    tokio::time::timeout(timeout, store.watch(path))
        .await
        .map_err(|_| StoreError::Timeout(format!("watch {path}")))?
}

/// The subscription loop for one service.
///
/// A store failure keeps the last-known view and re-subscribes after a
/// doubling backoff.
async fn run_watch_loop(
    store: Arc<dyn CoordinationStore>,
    path: String,
    cache: Arc<DiscoveryCache>,
    settings: DiscoverySettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = settings.retry_interval;

    'subscribe: loop {
        let result = match subscribe(store.as_ref(), &path, settings.operation_timeout).await {
            // Sync after subscribing so no change between the two is missed.
            Ok(rx) => sync_once(store.as_ref(), &path, &cache, &settings)
                .await
                .map(|()| rx),
            Err(e) => Err(e),
        };

        let mut changes = match result {
            Ok(rx) => {
                backoff = settings.retry_interval;
                rx
            }
            Err(e) => {
                warn!(%path, error = %e, backoff_ms = backoff.as_millis() as u64, "discovery subscription failed");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => break 'subscribe,
                }
                backoff = (backoff * 2).min(settings.max_backoff);
                continue 'subscribe;
            }
        };

        let mut resync =
            tokio::time::interval_at(Instant::now() + settings.resync_interval, settings.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        debug!(%path, "store dropped the watch, re-subscribing");
                        continue 'subscribe;
                    }
                }
                _ = resync.tick() => {}
                _ = shutdown.changed() => break 'subscribe,
            }

            if let Err(e) = sync_once(store.as_ref(), &path, &cache, &settings).await {
                warn!(%path, error = %e, "discovery sync failed, keeping last-known view");
                continue 'subscribe;
            }
        }
    }

    debug!(%path, "discovery watch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{NodeMetadata, node_path};
    use beacon_store::{CreateMode, Ensemble, StoreClient};

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            filter: NodeFilter::default(),
            resync_interval: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    async fn register(writer: &StoreClient, host: &str) -> String {
        let meta = NodeMetadata::new(host, 8080, "testing");
        let path = node_path("beacon", "orders", &meta);
        let payload = ServiceNode::healthy(meta).to_payload().unwrap();
        writer
            .create(&path, &payload, CreateMode::Ephemeral)
            .await
            .unwrap();
        path
    }

    /// Wait until the cache reaches `len` nodes.
    async fn wait_for_len(cache: &DiscoveryCache, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.len() != len {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn reader(ensemble: &Ensemble) -> DiscoveryClient {
        let store: Arc<dyn CoordinationStore> = Arc::new(ensemble.connect().unwrap());
        DiscoveryClient::new(store, "beacon", settings())
    }

    #[tokio::test]
    async fn unwatched_service_is_empty() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let client = reader(&ensemble);
        assert!(client.get_node("orders").is_none());
        assert!(client.list_nodes("orders").is_empty());
    }

    #[tokio::test]
    async fn initial_sync_sees_existing_nodes() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let writer = ensemble.connect().unwrap();
        register(&writer, "10.0.0.1").await;
        register(&writer, "10.0.0.2").await;

        let client = reader(&ensemble);
        let cache = client.watch_service("orders").await;
        assert_eq!(cache.len(), 2);

        let first = client.get_node("orders").unwrap();
        let second = client.get_node("orders").unwrap();
        assert_ne!(first.endpoint(), second.endpoint());
        assert_eq!(client.services(), vec!["orders"]);
    }

    #[tokio::test]
    async fn notifications_add_and_withdraw_nodes() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let writer = ensemble.connect().unwrap();
        let client = reader(&ensemble);
        let cache = client.watch_service("orders").await;
        assert!(cache.is_empty());

        let path = register(&writer, "10.0.0.1").await;
        wait_for_len(&cache, 1).await;
        assert_eq!(client.list_nodes("orders")[0].host(), "10.0.0.1");

        writer.delete(&path).await.unwrap();
        wait_for_len(&cache, 0).await;
        assert!(client.get_node("orders").is_none());
    }

    #[tokio::test]
    async fn outage_keeps_last_known_view_then_recovers() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let writer = ensemble.connect().unwrap();
        register(&writer, "10.0.0.1").await;

        let client = reader(&ensemble);
        let cache = client.watch_service("orders").await;
        assert_eq!(cache.len(), 1);

        ensemble.set_available(false);
        // A change the reader cannot fetch yet: the notification fires but
        // the rebuild fails.
        ensemble
            .expire_session(writer.session().unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.list_nodes("orders").len(), 1);

        ensemble.set_available(true);
        wait_for_len(&cache, 0).await;
    }

    #[tokio::test]
    async fn close_drops_all_subscriptions() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let writer = ensemble.connect().unwrap();
        register(&writer, "10.0.0.1").await;

        let client = reader(&ensemble);
        client.watch_service("orders").await;
        client.watch_service("billing").await;
        assert_eq!(client.services(), vec!["billing", "orders"]);

        client.close();
        assert!(client.services().is_empty());
        assert!(client.get_node("orders").is_none());
    }

    #[tokio::test]
    async fn watching_twice_returns_the_same_cache() {
        let ensemble = Ensemble::open_in_memory().unwrap();
        let client = reader(&ensemble);
        let a = client.watch_service("orders").await;
        let b = client.watch_service("orders").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
