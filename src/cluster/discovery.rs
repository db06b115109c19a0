//! Node discovery: a snapshot source the manager polls at startup and (for
//! dynamic mode) on an interval via the teacher's `ScheduledExecutor`.

use async_trait::async_trait;

use crate::config::DiscoveryConfig;
use crate::cluster::node::Node;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("external discovery source returned an error: {0}")]
    SourceUnavailable(String),
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Produce the authoritative node set. The manager diffs this against
    /// its current table; removed nodes have their cache state and provider
    /// released.
    async fn snapshot(&self) -> Result<Vec<Node>, DiscoveryError>;
}

pub struct StaticDiscovery {
    nodes: Vec<Node>,
}

impl StaticDiscovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        let nodes = config.nodes.iter().map(|spec| Node::new(spec.id.clone(), spec.base_url.clone())).collect();
        Self { nodes }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn snapshot(&self) -> Result<Vec<Node>, DiscoveryError> {
        Ok(self.nodes.clone())
    }
}

/// Polls an HTTP endpoint (the config's `namespace` field, reused here as
/// the discovery source URL) expecting a JSON array of `{id, base_url}`.
pub struct ExternalDiscovery {
    client: reqwest::Client,
    source_url: String,
}

impl ExternalDiscovery {
    pub fn new(client: reqwest::Client, config: &DiscoveryConfig) -> Self {
        let source_url = config.namespace.clone().unwrap_or_default();
        Self { client, source_url }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ExternalNodeEntry {
    id: String,
    base_url: String,
}

#[async_trait]
impl Discovery for ExternalDiscovery {
    async fn snapshot(&self) -> Result<Vec<Node>, DiscoveryError> {
        if self.source_url.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get(&self.source_url)
            .send()
            .await
            .map_err(|e| DiscoveryError::SourceUnavailable(e.to_string()))?;
        let entries: Vec<ExternalNodeEntry> =
            response.json().await.map_err(|e| DiscoveryError::SourceUnavailable(e.to_string()))?;
        Ok(entries.into_iter().map(|e| Node::new(e.id, e.base_url)).collect())
    }
}

pub fn build(client: reqwest::Client, config: &DiscoveryConfig) -> Box<dyn Discovery> {
    match config.mode.as_str() {
        "external" => Box::new(ExternalDiscovery::new(client, config)),
        _ => Box::new(StaticDiscovery::new(config)),
    }
}
