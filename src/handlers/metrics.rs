//! `GET /v1/circuit-breaker/metrics` — a JSON snapshot per node.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::response::Json;

use crate::AppState;
use crate::circuit_breaker::CircuitMetrics;

/// Snapshot of every node's circuit breaker, keyed by node id. Nodes with
/// no recorded traffic yet simply have no breaker and are omitted.
pub async fn get_circuit_breaker_metrics(State(state): State<AppState>) -> Json<BTreeMap<String, CircuitMetrics>> {
    let snapshot: BTreeMap<String, CircuitMetrics> =
        state.circuit_breakers.iter().map(|entry| (entry.key().clone(), entry.value().metrics())).collect();
    Json(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterManager;
    use crate::config::Config;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_state_returns_empty_map() {
        let state = AppState::new(Config::default(), ClusterManager::new());
        let Json(snapshot) = get_circuit_breaker_metrics(State(state)).await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn records_appear_once_a_breaker_is_used() {
        let state = AppState::new(Config::default(), ClusterManager::new());
        state.circuit_breaker_for("n1").record_success(Duration::from_millis(10));
        let Json(snapshot) = get_circuit_breaker_metrics(State(state)).await;
        assert!(snapshot.contains_key("n1"));
    }
}
