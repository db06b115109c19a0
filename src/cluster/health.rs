//! Periodic health probing and the rolling-counter update rules that flip a
//! node between healthy/unhealthy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::HealthConfig;
use crate::cluster::node::{Node, NodeId, NodeStatus};
use crate::utils::scheduled_executor::ScheduledTask;

#[derive(Debug, Clone)]
pub struct HealthTracker {
    nodes: Arc<DashMap<NodeId, Node>>,
    config: HealthConfig,
    client: reqwest::Client,
}

impl HealthTracker {
    pub fn new(nodes: Arc<DashMap<NodeId, Node>>, config: HealthConfig, client: reqwest::Client) -> Self {
        Self { nodes, config, client }
    }

    pub fn record_success(&self, node_id: &str, latency: Duration) {
        let Some(mut entry) = self.nodes.get_mut(node_id) else { return };
        let node = entry.value_mut();
        node.health.last_check = Some(Instant::now());
        node.health.consecutive_failures = 0;
        node.health.consecutive_successes += 1;
        node.health.total_checks += 1;

        let latency_ms = latency.as_secs_f64() * 1000.0;
        node.health.moving_avg_latency_ms = if node.health.total_checks <= 1 {
            latency_ms
        } else {
            node.health.moving_avg_latency_ms * 0.8 + latency_ms * 0.2
        };
        node.health.error_rate = node.health.total_failures as f64 / node.health.total_checks as f64;

        if node.health.consecutive_successes >= self.config.healthy_after_successes {
            node.status = NodeStatus::Healthy;
        }
    }

    pub fn record_failure(&self, node_id: &str) {
        let Some(mut entry) = self.nodes.get_mut(node_id) else { return };
        let node = entry.value_mut();
        node.health.last_check = Some(Instant::now());
        node.health.consecutive_successes = 0;
        node.health.consecutive_failures += 1;
        node.health.total_checks += 1;
        node.health.total_failures += 1;
        node.health.error_rate = node.health.total_failures as f64 / node.health.total_checks as f64;

        if node.health.error_rate >= self.config.unhealthy_threshold
            || node.health.consecutive_failures >= self.config.max_consecutive_failures
        {
            node.status = NodeStatus::Unhealthy;
        }
    }

    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).map(|n| n.is_healthy()).unwrap_or(false)
    }

    pub fn get_node_health(&self, node_id: &str) -> Option<crate::cluster::node::HealthSample> {
        self.nodes.get(node_id).map(|n| n.health.clone())
    }

    /// Probe every known node once: a bare GET against `{base_url}/health`
    /// within the configured timeout.
    pub async fn probe_all(&self) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        for node_id in ids {
            let Some(base_url) = self.nodes.get(&node_id).map(|n| n.base_url.clone()) else { continue };
            let url = format!("{}/health", base_url.trim_end_matches('/'));
            let start = Instant::now();
            let timeout = Duration::from_millis(self.config.timeout_ms);
            let result = tokio::time::timeout(timeout, self.client.get(&url).send()).await;

            match result {
                Ok(Ok(response)) if response.status().is_success() => {
                    self.record_success(&node_id, start.elapsed());
                },
                _ => {
                    self.record_failure(&node_id);
                },
            }
        }
    }
}

pub struct HealthProbeTask {
    tracker: HealthTracker,
}

impl HealthProbeTask {
    pub fn new(tracker: HealthTracker) -> Self {
        Self { tracker }
    }
}

impl ScheduledTask for HealthProbeTask {
    fn run(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            self.tracker.probe_all().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> HealthConfig {
        HealthConfig {
            check_interval_ms: 1_000,
            timeout_ms: 500,
            unhealthy_threshold: 0.5,
            max_consecutive_failures: 3,
            healthy_after_successes: 2,
        }
    }

    fn tracker_with(node: Node) -> HealthTracker {
        let nodes = Arc::new(DashMap::new());
        nodes.insert(node.id.clone(), node);
        HealthTracker::new(nodes, test_config(), reqwest::Client::new())
    }

    #[test]
    fn becomes_healthy_after_success_threshold() {
        let tracker = tracker_with(Node::new("n1", "http://localhost:9000"));
        tracker.record_success("n1", Duration::from_millis(10));
        assert!(!tracker.is_healthy("n1"));
        tracker.record_success("n1", Duration::from_millis(10));
        assert!(tracker.is_healthy("n1"));
    }

    #[test]
    fn becomes_unhealthy_after_max_consecutive_failures() {
        let mut node = Node::new("n1", "http://localhost:9000");
        node.status = NodeStatus::Healthy;
        let tracker = tracker_with(node);
        for _ in 0..3 {
            tracker.record_failure("n1");
        }
        assert!(!tracker.is_healthy("n1"));
    }

    #[test]
    fn unknown_node_is_not_healthy() {
        let tracker = tracker_with(Node::new("n1", "http://localhost:9000"));
        assert!(!tracker.is_healthy("does-not-exist"));
    }

    #[test]
    fn a_single_success_resets_consecutive_failures() {
        let mut node = Node::new("n1", "http://localhost:9000");
        node.status = NodeStatus::Healthy;
        let tracker = tracker_with(node);
        tracker.record_failure("n1");
        tracker.record_failure("n1");
        tracker.record_success("n1", Duration::from_millis(5));
        let health = tracker.get_node_health("n1").unwrap();
        assert_eq!(health.consecutive_failures, 0);
    }
}
