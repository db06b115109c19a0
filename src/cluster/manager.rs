//! The cluster manager: an explicitly-owned lifecycle object, not an
//! ambient singleton (§9's "Singleton manager with process-wide state").
//! Callers construct one at startup, pass it through the request context,
//! and call `shutdown` on it — never a global `get()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::ClusterConfig;
use crate::cluster::cache::CacheTracker;
use crate::cluster::discovery::{self, Discovery};
use crate::cluster::health::{HealthProbeTask, HealthTracker};
use crate::cluster::node::{Node, NodeId};
use crate::cluster::provider::{ChatProvider, OpenAiCompatibleProvider};
use crate::cluster::router::{Router, RoutingContext, RoutingDecision};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("cluster manager is already initialized")]
    AlreadyInitialized,
}

struct Running {
    nodes: Arc<DashMap<NodeId, Node>>,
    providers: Arc<DashMap<NodeId, Arc<dyn ChatProvider>>>,
    router: Router,
    health: HealthTracker,
    health_task: Option<JoinHandle<()>>,
}

/// Owns the node table, provider map, and sticky-session table. Construct
/// with [`ClusterManager::new`]; call [`ClusterManager::initialize`] once.
pub struct ClusterManager {
    initialized: AtomicBool,
    state: AsyncMutex<Option<Running>>,
}

impl ClusterManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { initialized: AtomicBool::new(false), state: AsyncMutex::new(None) })
    }

    /// Validate config, build discovery/health/cache/router, snapshot nodes,
    /// and construct one provider per discovered node. A node whose provider
    /// fails to construct is logged and excluded, not fatal.
    pub async fn initialize(&self, config: &ClusterConfig) -> Result<(), ManagerError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            self.initialized.store(true, Ordering::SeqCst);
            return Err(ManagerError::AlreadyInitialized);
        }

        let client = reqwest::Client::new();
        let discovery = discovery::build(client.clone(), &config.discovery);

        let snapshot = match discovery.snapshot().await {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(error = %err, "discovery failed during initialize, starting with no nodes");
                Vec::new()
            },
        };

        let nodes: Arc<DashMap<NodeId, Node>> = Arc::new(DashMap::new());
        let providers: Arc<DashMap<NodeId, Arc<dyn ChatProvider>>> = Arc::new(DashMap::new());

        for mut node in snapshot {
            node.status = crate::cluster::node::NodeStatus::Initializing;
            let node_id = node.id.clone();
            let base_url = node.base_url.clone();

            let provider_timeout = Duration::from_millis(config.health.timeout_ms.max(1) * 10);
            let provider: Arc<dyn ChatProvider> =
                Arc::new(OpenAiCompatibleProvider::new(base_url.clone(), provider_timeout));

            providers.insert(node_id.clone(), provider);
            nodes.insert(node_id.clone(), node);
            tracing::info!(node_id = %node_id, base_url = %base_url, "cluster node registered");
        }

        let health = HealthTracker::new(nodes.clone(), config.health.clone(), client.clone());
        let cache = CacheTracker::new(nodes.clone(), &config.cache);
        let router = Router::new(nodes.clone(), health.clone(), cache, config.routing.clone());

        let health_task = {
            let tracker = health.clone();
            let interval = Duration::from_millis(config.health.check_interval_ms.max(1));
            Some(tokio::spawn(async move {
                let task = HealthProbeTask::new(tracker);
                let executor = crate::utils::scheduled_executor::ScheduledExecutor::new("cluster-health-probe", interval);
                executor.start(task).await;
            }))
        };

        let mut state = self.state.lock().await;
        *state = Some(Running { nodes, providers, router, health, health_task });

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub async fn select_node(&self, context: &RoutingContext) -> Option<RoutingDecision> {
        let state = self.state.lock().await;
        state.as_ref().and_then(|s| s.router.select(context))
    }

    pub async fn get_node_provider(&self, node_id: &str) -> Option<Arc<dyn ChatProvider>> {
        let state = self.state.lock().await;
        state.as_ref().and_then(|s| s.providers.get(node_id).map(|p| p.clone()))
    }

    pub async fn record_node_success(&self, node_id: &str, latency: Duration) {
        let state = self.state.lock().await;
        if let Some(s) = state.as_ref() {
            s.health.record_success(node_id, latency);
        }
    }

    pub async fn record_node_failure(&self, node_id: &str) {
        let state = self.state.lock().await;
        if let Some(s) = state.as_ref() {
            s.health.record_failure(node_id);
        }
    }

    /// Records the node's cached system-prompt prefix after a successful
    /// upstream call, so cache-aware routing has candidates to select from.
    pub async fn record_node_cache(&self, node_id: &str, system_prompt_hash: u64, token_count: usize) {
        let state = self.state.lock().await;
        if let Some(s) = state.as_ref() {
            s.router.cache().record_cached(node_id, system_prompt_hash, token_count);
        }
    }

    pub async fn node_count(&self) -> usize {
        let state = self.state.lock().await;
        state.as_ref().map(|s| s.nodes.len()).unwrap_or(0)
    }

    /// Idempotent and exception-tolerant: aborts the health task, drops the
    /// node/provider tables, and flips `initialized=false` regardless of
    /// whether it had already run.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(running) = state.take()
            && let Some(handle) = running.health_task
        {
            handle.abort();
        }
        self.initialized.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, DiscoveryConfig, HealthConfig, NodeSpec, RoutingConfig};

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            discovery: DiscoveryConfig {
                mode: "static".to_string(),
                nodes: vec![NodeSpec { id: "n1".to_string(), base_url: "http://localhost:9000".to_string() }],
                namespace: None,
                selector: None,
            },
            health: HealthConfig {
                check_interval_ms: 60_000,
                timeout_ms: 500,
                unhealthy_threshold: 0.5,
                max_consecutive_failures: 3,
                healthy_after_successes: 2,
            },
            cache: CacheConfig { max_age_secs: 300, min_hit_rate: 0.1, max_cache_tokens: 50_000 },
            routing: RoutingConfig {
                strategy: "round-robin".to_string(),
                max_retries: 2,
                retry_delay_ms: 250,
                sticky_ttl_secs: 600,
            },
        }
    }

    #[tokio::test]
    async fn initialize_registers_discovered_nodes() {
        let manager = ClusterManager::new();
        manager.initialize(&test_config()).await.unwrap();
        assert_eq!(manager.node_count().await, 1);
        assert!(manager.get_node_provider("n1").await.is_some());
    }

    #[tokio::test]
    async fn double_initialize_rejects() {
        let manager = ClusterManager::new();
        manager.initialize(&test_config()).await.unwrap();
        let err = manager.initialize(&test_config()).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn shutdown_then_initialize_succeeds() {
        let manager = ClusterManager::new();
        manager.initialize(&test_config()).await.unwrap();
        manager.shutdown().await;
        assert_eq!(manager.node_count().await, 0);
        manager.initialize(&test_config()).await.unwrap();
        assert_eq!(manager.node_count().await, 1);
    }

    #[tokio::test]
    async fn after_shutdown_provider_lookup_returns_none() {
        let manager = ClusterManager::new();
        manager.initialize(&test_config()).await.unwrap();
        manager.shutdown().await;
        assert!(manager.get_node_provider("n1").await.is_none());
    }
}
