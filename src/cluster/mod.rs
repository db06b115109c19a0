//! Cluster discovery, health, cache-affinity, routing, per-node providers,
//! and the lifecycle-owned manager that composes them.

pub mod cache;
pub mod discovery;
pub mod health;
pub mod manager;
pub mod node;
pub mod provider;
pub mod router;

pub use manager::ClusterManager;
pub use node::{Node, NodeId, NodeStatus};
pub use provider::{ChatProvider, ProviderError};
pub use router::{RoutingContext, RoutingDecision};
