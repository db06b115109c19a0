//! `GET /v1/models` — pass-through to the currently selected backend's
//! model list, normalized to the Anthropic schema.

use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};

use crate::AppState;
use crate::cluster::RoutingContext;
use crate::errors::{ApiError, ApiResult};

pub async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let context = RoutingContext { system_prompt_hash: 0, tools_hash: 0, request_tokens: 0, session_id: None };
    let decision = state
        .cluster
        .select_node(&context)
        .await
        .ok_or_else(|| ApiError::overloaded("No healthy cluster nodes available"))?;

    let provider = state.cluster.get_node_provider(&decision.node_id).await.ok_or_else(|| {
        ApiError::api(format!("no provider registered for node {}", decision.node_id))
    })?;

    let url = format!("{}/models", provider.base_url().trim_end_matches('/'));
    let response = state
        .http_client
        .get(&url)
        .send()
        .await
        .map_err(|e| ApiError::api(format!("failed to reach backend model list at {url}: {e}")))?;

    let body: Value = response
        .json()
        .await
        .map_err(|e| ApiError::api(format!("failed to parse model list from {url}: {e}")))?;

    Ok(Json(normalize_model_list(body)))
}

/// OpenAI's `{ object: "list", data: [{ id, created, owned_by, ... }] }`
/// into Anthropic's `{ data: [{ id, type: "model", display_name, created_at }], has_more: false }`.
fn normalize_model_list(openai_list: Value) -> Value {
    let entries = openai_list.get("data").and_then(|d| d.as_array()).cloned().unwrap_or_default();
    let data: Vec<Value> = entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.get("id")?.as_str()?.to_string();
            let created_at = entry
                .get("created")
                .and_then(|c| c.as_i64())
                .map(|secs| chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.to_rfc3339()))
                .flatten()
                .unwrap_or_default();
            Some(json!({
                "id": id.clone(),
                "type": "model",
                "display_name": id,
                "created_at": created_at,
            }))
        })
        .collect();

    json!({ "data": data, "has_more": false })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_openai_shape_into_anthropic_shape() {
        let openai = json!({
            "object": "list",
            "data": [
                { "id": "local-model-7b", "object": "model", "created": 0, "owned_by": "local" },
            ],
        });
        let normalized = normalize_model_list(openai);
        let data = normalized["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "local-model-7b");
        assert_eq!(data[0]["type"], "model");
        assert_eq!(normalized["has_more"], false);
    }

    #[test]
    fn missing_data_field_yields_empty_list() {
        let normalized = normalize_model_list(json!({}));
        assert_eq!(normalized["data"].as_array().unwrap().len(), 0);
    }
}
