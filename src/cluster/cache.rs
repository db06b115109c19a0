//! Cache-affinity tracking: per-node record of the last known cached
//! prompt-prefix hash and approximate token count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::CacheConfig;
use crate::cluster::node::{Node, NodeId};

#[derive(Debug, Clone)]
pub struct CacheTracker {
    nodes: Arc<DashMap<NodeId, Node>>,
    max_age: Duration,
}

impl CacheTracker {
    pub fn new(nodes: Arc<DashMap<NodeId, Node>>, config: &CacheConfig) -> Self {
        Self { nodes, max_age: Duration::from_secs(config.max_age_secs) }
    }

    pub fn record_cached(&self, node_id: &str, system_prompt_hash: u64, token_count: usize) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            let node = entry.value_mut();
            node.cache.system_prompt_hash = Some(system_prompt_hash);
            node.cache.cached_tokens = token_count;
            node.cache.last_updated = Some(Instant::now());
        }
    }

    /// A node is a cache-affinity candidate when its recorded hash matches
    /// and the cached prefix covers the request (stale entries ignored).
    pub fn is_cache_affinity_candidate(&self, node_id: &str, system_prompt_hash: u64, request_tokens: usize) -> bool {
        let Some(entry) = self.nodes.get(node_id) else { return false };
        let node = entry.value();

        let Some(last_updated) = node.cache.last_updated else { return false };
        if last_updated.elapsed() > self.max_age {
            return false;
        }

        node.cache.system_prompt_hash == Some(system_prompt_hash) && node.cache.cached_tokens >= request_tokens
    }

    pub fn candidates(&self, node_ids: &[NodeId], system_prompt_hash: u64, request_tokens: usize) -> Vec<NodeId> {
        node_ids
            .iter()
            .filter(|id| self.is_cache_affinity_candidate(id, system_prompt_hash, request_tokens))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker() -> (CacheTracker, Arc<DashMap<NodeId, Node>>) {
        let nodes = Arc::new(DashMap::new());
        nodes.insert("n1".to_string(), Node::new("n1", "http://localhost:9000"));
        let config = CacheConfig { max_age_secs: 300, min_hit_rate: 0.1, max_cache_tokens: 50_000 };
        (CacheTracker::new(nodes.clone(), &config), nodes)
    }

    #[test]
    fn matching_hash_and_sufficient_tokens_is_a_candidate() {
        let (tracker, _nodes) = test_tracker();
        tracker.record_cached("n1", 42, 1000);
        assert!(tracker.is_cache_affinity_candidate("n1", 42, 500));
    }

    #[test]
    fn mismatched_hash_is_not_a_candidate() {
        let (tracker, _nodes) = test_tracker();
        tracker.record_cached("n1", 42, 1000);
        assert!(!tracker.is_cache_affinity_candidate("n1", 99, 500));
    }

    #[test]
    fn insufficient_cached_tokens_is_not_a_candidate() {
        let (tracker, _nodes) = test_tracker();
        tracker.record_cached("n1", 42, 100);
        assert!(!tracker.is_cache_affinity_candidate("n1", 42, 500));
    }

    #[test]
    fn stale_entry_is_not_a_candidate() {
        let (tracker, nodes) = test_tracker();
        tracker.record_cached("n1", 42, 1000);
        {
            let mut entry = nodes.get_mut("n1").unwrap();
            entry.value_mut().cache.last_updated = Some(Instant::now() - Duration::from_secs(301));
        }
        assert!(!tracker.is_cache_affinity_candidate("n1", 42, 500));
    }

    #[test]
    fn unknown_node_is_never_a_candidate() {
        let (tracker, _nodes) = test_tracker();
        assert!(!tracker.is_cache_affinity_candidate("missing", 42, 1));
    }
}
