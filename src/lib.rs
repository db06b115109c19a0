//! Gateway library: an Anthropic-API-compatible proxy over a pool of
//! OpenAI-compatible inference backends.

use std::sync::Arc;

use dashmap::DashMap;

pub mod circuit_breaker;
pub mod cluster;
pub mod config;
pub mod critical_classifier;
pub mod errors;
pub mod handlers;
pub mod safe_filter;
pub mod section_parser;
pub mod server_tools;
pub mod tool_injector;
pub mod translator;
pub mod utils;

use circuit_breaker::CircuitBreaker;
use cluster::ClusterManager;
use cluster::node::NodeId;
use config::Config;

/// Shared application state, composed once at startup and cloned cheaply
/// into every request handler. No ambient singletons: the cluster manager
/// and circuit breakers live here, not behind a `static`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cluster: Arc<ClusterManager>,
    pub circuit_breakers: Arc<DashMap<NodeId, CircuitBreaker>>,
    pub http_client: reqwest::Client,
    /// Per-conversation tool-injection counters; keyed on the request
    /// metadata's user id when present, a fixed key otherwise.
    pub injection_counts: Arc<DashMap<String, u32>>,
}

impl AppState {
    pub fn new(config: Config, cluster: Arc<ClusterManager>) -> Self {
        Self {
            config: Arc::new(config),
            cluster,
            circuit_breakers: Arc::new(DashMap::new()),
            http_client: reqwest::Client::new(),
            injection_counts: Arc::new(DashMap::new()),
        }
    }

    /// Lazily creates a node's circuit breaker on first use.
    pub fn circuit_breaker_for(&self, node_id: &str) -> CircuitBreaker {
        if let Some(existing) = self.circuit_breakers.get(node_id) {
            return existing.clone();
        }
        let breaker = CircuitBreaker::new((&self.config.circuit_breaker).into());
        self.circuit_breakers.insert(node_id.to_string(), breaker.clone());
        breaker
    }
}
