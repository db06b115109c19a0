//! The `Node` record and the rolling counters the health and cache trackers
//! mutate in place.

use std::time::Instant;

use serde::Serialize;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Initializing,
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

#[derive(Debug, Clone)]
pub struct HealthSample {
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub moving_avg_latency_ms: f64,
    pub error_rate: f64,
    pub total_checks: u64,
    pub total_failures: u64,
}

impl Default for HealthSample {
    fn default() -> Self {
        Self {
            last_check: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            moving_avg_latency_ms: 0.0,
            error_rate: 0.0,
            total_checks: 0,
            total_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheState {
    pub system_prompt_hash: Option<u64>,
    pub cached_tokens: usize,
    pub last_updated: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub requests_in_flight: u64,
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_lookups: u64,
    pub avg_latency_ms: f64,
}

impl NodeMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.cache_lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.cache_lookups as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub base_url: String,
    pub status: NodeStatus,
    pub health: HealthSample,
    pub cache: CacheState,
    pub metrics: NodeMetrics,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            status: NodeStatus::Initializing,
            health: HealthSample::default(),
            cache: CacheState::default(),
            metrics: NodeMetrics::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy | NodeStatus::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_initializing_and_unhealthy() {
        let node = Node::new("n1", "http://localhost:9000");
        assert_eq!(node.status, NodeStatus::Initializing);
        assert!(!node.is_healthy());
    }

    #[test]
    fn healthy_and_degraded_both_count_as_healthy_for_routing() {
        let mut node = Node::new("n1", "http://localhost:9000");
        node.status = NodeStatus::Degraded;
        assert!(node.is_healthy());
    }

    #[test]
    fn cache_hit_rate_is_zero_with_no_lookups() {
        let metrics = NodeMetrics::default();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
    }
}
