//! Node selection: sticky sessions first, then cache affinity, then the
//! configured load-balancing strategy.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::config::RoutingConfig;
use crate::cluster::cache::CacheTracker;
use crate::cluster::health::HealthTracker;
use crate::cluster::node::{Node, NodeId};

#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub system_prompt_hash: u64,
    pub tools_hash: u64,
    pub request_tokens: usize,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub node_id: NodeId,
    pub reason: &'static str,
    pub confidence: f64,
}

struct StickyEntry {
    node_id: NodeId,
    expires_at: Instant,
}

pub struct Router {
    nodes: Arc<DashMap<NodeId, Node>>,
    health: HealthTracker,
    cache: CacheTracker,
    config: RoutingConfig,
    sticky: DashMap<String, StickyEntry>,
    round_robin_index: AtomicUsize,
}

impl Router {
    pub fn new(
        nodes: Arc<DashMap<NodeId, Node>>,
        health: HealthTracker,
        cache: CacheTracker,
        config: RoutingConfig,
    ) -> Self {
        Self { nodes, health, cache, config, sticky: DashMap::new(), round_robin_index: AtomicUsize::new(0) }
    }

    pub fn cache(&self) -> &CacheTracker {
        &self.cache
    }

    fn healthy_node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|e| self.health.is_healthy(e.key())).map(|e| e.key().clone()).collect()
    }

    pub fn select(&self, context: &RoutingContext) -> Option<RoutingDecision> {
        if let Some(session_id) = &context.session_id
            && let Some(entry) = self.sticky.get(session_id)
            && entry.expires_at > Instant::now()
            && self.health.is_healthy(&entry.node_id)
        {
            let node_id = entry.node_id.clone();
            drop(entry);
            self.remember_sticky(context, &node_id);
            return Some(RoutingDecision { node_id, reason: "sticky-session", confidence: 1.0 });
        }

        let healthy = self.healthy_node_ids();
        if healthy.is_empty() {
            return None;
        }

        let decision = if self.config.strategy == "cache-aware" {
            self.select_cache_aware(&healthy, context).or_else(|| self.select_by_strategy(&healthy))
        } else {
            self.select_by_strategy(&healthy)
        }?;

        self.remember_sticky(context, &decision.node_id);
        Some(decision)
    }

    fn remember_sticky(&self, context: &RoutingContext, node_id: &str) {
        if let Some(session_id) = &context.session_id {
            self.sticky.insert(
                session_id.clone(),
                StickyEntry {
                    node_id: node_id.to_string(),
                    expires_at: Instant::now() + Duration::from_secs(self.config.sticky_ttl_secs),
                },
            );
        }
    }

    fn select_cache_aware(&self, healthy: &[NodeId], context: &RoutingContext) -> Option<RoutingDecision> {
        let candidates = self.cache.candidates(healthy, context.system_prompt_hash, context.request_tokens);
        if candidates.is_empty() {
            return None;
        }
        let best = candidates
            .iter()
            .filter_map(|id| self.nodes.get(id).map(|n| (id.clone(), n.metrics.clone())))
            .min_by(|(_, a), (_, b)| {
                a.requests_in_flight
                    .cmp(&b.requests_in_flight)
                    .then(a.avg_latency_ms.partial_cmp(&b.avg_latency_ms).unwrap())
            })?;
        Some(RoutingDecision { node_id: best.0, reason: "cache-affinity", confidence: 0.9 })
    }

    fn select_by_strategy(&self, healthy: &[NodeId]) -> Option<RoutingDecision> {
        match self.config.strategy.as_str() {
            "round-robin" => {
                let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % healthy.len();
                Some(RoutingDecision { node_id: healthy[idx].clone(), reason: "round-robin", confidence: 0.5 })
            },
            "least-loaded" => {
                let best = healthy
                    .iter()
                    .filter_map(|id| self.nodes.get(id).map(|n| (id.clone(), n.metrics.clone())))
                    .min_by(|(_, a), (_, b)| {
                        a.requests_in_flight
                            .cmp(&b.requests_in_flight)
                            .then(a.avg_latency_ms.partial_cmp(&b.avg_latency_ms).unwrap())
                    })?;
                Some(RoutingDecision { node_id: best.0, reason: "least-loaded", confidence: 0.7 })
            },
            "latency-based" => {
                let mut with_samples: Vec<(NodeId, f64)> = healthy
                    .iter()
                    .filter_map(|id| {
                        self.nodes.get(id).and_then(|n| {
                            (n.health.total_checks > 0).then_some((id.clone(), n.metrics.avg_latency_ms))
                        })
                    })
                    .collect();
                if with_samples.is_empty() {
                    return Some(RoutingDecision {
                        node_id: healthy[0].clone(),
                        reason: "latency-based-no-samples",
                        confidence: 0.3,
                    });
                }
                with_samples.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
                Some(RoutingDecision { node_id: with_samples[0].0.clone(), reason: "latency-based", confidence: 0.8 })
            },
            _ => self.select_cache_aware_fallback(healthy),
        }
    }

    fn select_cache_aware_fallback(&self, healthy: &[NodeId]) -> Option<RoutingDecision> {
        healthy.first().map(|id| RoutingDecision { node_id: id.clone(), reason: "fallback", confidence: 0.2 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_router(strategy: &str) -> Router {
        let nodes = Arc::new(DashMap::new());
        let mut a = Node::new("a", "http://localhost:9001");
        a.status = crate::cluster::node::NodeStatus::Healthy;
        let mut b = Node::new("b", "http://localhost:9002");
        b.status = crate::cluster::node::NodeStatus::Healthy;
        nodes.insert("a".to_string(), a);
        nodes.insert("b".to_string(), b);

        let health_config = crate::config::HealthConfig {
            check_interval_ms: 1000,
            timeout_ms: 500,
            unhealthy_threshold: 0.5,
            max_consecutive_failures: 3,
            healthy_after_successes: 2,
        };
        let health = HealthTracker::new(nodes.clone(), health_config, reqwest::Client::new());
        let cache_config =
            crate::config::CacheConfig { max_age_secs: 300, min_hit_rate: 0.1, max_cache_tokens: 50_000 };
        let cache = CacheTracker::new(nodes.clone(), &cache_config);
        let routing_config = RoutingConfig {
            strategy: strategy.to_string(),
            max_retries: 2,
            retry_delay_ms: 250,
            sticky_ttl_secs: 600,
        };
        Router::new(nodes, health, cache, routing_config)
    }

    fn context(session_id: Option<&str>) -> RoutingContext {
        RoutingContext {
            system_prompt_hash: 1,
            tools_hash: 2,
            request_tokens: 10,
            session_id: session_id.map(|s| s.to_string()),
        }
    }

    #[test]
    fn sticky_session_returns_the_same_node_twice() {
        let router = test_router("round-robin");
        let first = router.select(&context(Some("s1"))).unwrap();
        let second = router.select(&context(Some("s1"))).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(second.reason, "sticky-session");
    }

    #[test]
    fn round_robin_rotates_through_healthy_nodes() {
        let router = test_router("round-robin");
        let first = router.select(&context(None)).unwrap();
        let second = router.select(&context(None)).unwrap();
        assert_ne!(first.node_id, second.node_id);
    }

    #[test]
    fn no_healthy_nodes_returns_none() {
        let router = test_router("round-robin");
        for mut entry in router.nodes.iter_mut() {
            entry.value_mut().status = crate::cluster::node::NodeStatus::Unhealthy;
        }
        assert!(router.select(&context(None)).is_none());
    }

    #[test]
    fn cache_aware_prefers_affinity_candidate() {
        let router = test_router("cache-aware");
        router.cache.record_cached("b", 1, 100);
        let decision = router.select(&context(None)).unwrap();
        assert_eq!(decision.node_id, "b");
        assert_eq!(decision.reason, "cache-affinity");
    }

    #[test]
    fn cache_aware_falls_back_to_least_loaded_without_candidates() {
        let router = test_router("cache-aware");
        let decision = router.select(&context(None)).unwrap();
        assert!(decision.node_id == "a" || decision.node_id == "b");
    }
}
