//! Discovery cache: immutable node snapshots swapped atomically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use tracing::debug;

use beacon_core::{DiscoveryConfig, NodeHealth, ServiceNode};
use beacon_store::ChildNode;

/// Which registry records make it into the cache.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Only nodes advertising this environment.
    pub environment: Option<String>,
    /// Drop records whose last refresh is older than this.
    pub max_node_age_ms: Option<u64>,
}

impl NodeFilter {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            environment: config.environment.clone(),
            max_node_age_ms: config.max_node_age_ms,
        }
    }

    pub fn accepts(&self, node: &ServiceNode, now_ms: u64) -> bool {
        if node.health != NodeHealth::Healthy {
            return false;
        }
        if let Some(env) = &self.environment {
            if &node.metadata.environment != env {
                return false;
            }
        }
        if let Some(max_age) = self.max_node_age_ms {
            if node.age_ms(now_ms) > max_age {
                return false;
            }
        }
        true
    }
}

/// Outcome of one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub accepted: u32,
    pub filtered: u32,
    pub malformed: u32,
}

/// Parse registry children into cacheable nodes, in child order.
pub fn decode_children(
    children: &[ChildNode],
    filter: &NodeFilter,
    now_ms: u64,
) -> (Vec<ServiceNode>, SyncStats) {
    let mut stats = SyncStats::default();
    let mut nodes = Vec::with_capacity(children.len());
    for child in children {
        match ServiceNode::from_payload(&child.data) {
            Ok(node) if filter.accepts(&node, now_ms) => {
                stats.accepted += 1;
                nodes.push(node);
            }
            Ok(_) => stats.filtered += 1,
            Err(e) => {
                debug!(node = %child.name, error = %e, "skipping malformed registry record");
                stats.malformed += 1;
            }
        }
    }
    (nodes, stats)
}

/// The cached node set for one service.
///
/// Readers get whole snapshots and never block the writer.
pub struct DiscoveryCache {
    nodes: ArcSwap<Vec<ServiceNode>>,
    counter: AtomicUsize,
    generation: AtomicU64,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            counter: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Swap in a new node set.
    pub fn replace(&self, nodes: Vec<ServiceNode>) {
        self.nodes.store(Arc::new(nodes));
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn clear(&self) {
        self.replace(Vec::new());
    }

    pub fn snapshot(&self) -> Arc<Vec<ServiceNode>> {
        self.nodes.load_full()
    }

    /// One node, round-robin over the current snapshot.
    pub fn pick(&self) -> Option<ServiceNode> {
        let nodes = self.nodes.load();
        if nodes.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(nodes[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rebuilds applied so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::NodeMetadata;

    fn node(host: &str, env: &str, updated_ms: u64) -> ServiceNode {
        ServiceNode {
            metadata: NodeMetadata::new(host, 8080, env),
            health: NodeHealth::Healthy,
            last_updated_ms: updated_ms,
        }
    }

    fn child(node: &ServiceNode) -> ChildNode {
        ChildNode {
            name: node.endpoint(),
            data: node.to_payload().unwrap(),
        }
    }

    #[test]
    fn pick_round_robins() {
        let cache = DiscoveryCache::new();
        cache.replace(vec![node("a", "prod", 0), node("b", "prod", 0)]);

        let hosts: Vec<String> = (0..4)
            .map(|_| cache.pick().unwrap().metadata.host)
            .collect();
        assert_eq!(hosts, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn empty_cache_picks_nothing() {
        let cache = DiscoveryCache::new();
        assert!(cache.pick().is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 0);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_replace() {
        let cache = DiscoveryCache::new();
        cache.replace(vec![node("a", "prod", 0)]);
        let before = cache.snapshot();

        cache.clear();
        assert_eq!(before.len(), 1);
        assert!(cache.snapshot().is_empty());
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn decode_applies_filter_and_skips_garbage() {
        let mut unhealthy = node("sick", "prod", 10_000);
        unhealthy.health = NodeHealth::Unhealthy;
        let children = vec![
            child(&node("a", "prod", 10_000)),
            child(&node("b", "staging", 10_000)),
            child(&node("old", "prod", 1_000)),
            child(&unhealthy),
            ChildNode {
                name: "junk:1".to_string(),
                data: b"not json".to_vec(),
            },
        ];
        let filter = NodeFilter {
            environment: Some("prod".to_string()),
            max_node_age_ms: Some(5_000),
        };

        let (nodes, stats) = decode_children(&children, &filter, 12_000);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].metadata.host, "a");
        assert_eq!(
            stats,
            SyncStats {
                accepted: 1,
                filtered: 3,
                malformed: 1
            }
        );
    }

    #[test]
    fn default_filter_accepts_any_healthy_node() {
        let filter = NodeFilter::default();
        assert!(filter.accepts(&node("a", "anything", 0), u64::MAX));
    }
}
