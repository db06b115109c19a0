//! `POST /v1/messages` — the proxy's main pipeline: filter → server-side
//! tools → tool-instruction injection → translate → route → stream back.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt, stream};
use serde_json::{Value, json};

use crate::AppState;
use crate::cluster::RoutingContext;
use crate::cluster::provider::ChatStream;
use crate::errors::ApiError;
use crate::safe_filter::{self, FilterOptions, Tier};
use crate::server_tools::{self, ToolSpec};
use crate::tool_injector::{self, InjectionStyle, InjectorConfig};
use crate::translator::{
    self, AnthropicContent, AnthropicRequest, AnthropicStreamEvent, AnthropicSystem, BackendQuirks,
    StreamAssembler,
};

const MAX_PROMPT_BYTES: usize = 1024 * 1024;

pub async fn create_message(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if body.is_empty() {
        return ApiError::invalid_request("request body is empty").into_response();
    }
    if body.len() > MAX_PROMPT_BYTES {
        return ApiError::invalid_request(format!(
            "request body of {} bytes exceeds the {MAX_PROMPT_BYTES} byte limit",
            body.len()
        ))
        .into_response();
    }

    let mut request: AnthropicRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return ApiError::invalid_request(format!("malformed request body: {e}")).into_response(),
    };

    // Step 2: compress the system prompt.
    let tier = resolve_tier(&headers, &state.config.filter.default_tier);
    let system_text = request.system.as_ref().map(system_text_of).unwrap_or_default();
    let filter_result = safe_filter::filter(&system_text, tier, &FilterOptions::default());
    tracing::info!(
        applied_tier = filter_result.applied_tier.as_str(),
        reduction_percent = filter_result.stats.reduction_percent,
        fallback_occurred = filter_result.fallback_occurred,
        "system prompt filtered"
    );
    request.system = Some(AnthropicSystem::Text(filter_result.filtered_prompt.clone()));

    // Step 3: recognize and execute server-side tools (web search).
    let raw_tools = request.tools.clone().unwrap_or_default();
    let tool_specs: Vec<ToolSpec> =
        raw_tools.iter().filter_map(|t| serde_json::from_value(t.clone()).ok()).collect();
    let filtered_tools = server_tools::filter_server_side_tools(tool_specs);
    let forwarded_tools: Vec<Value> = raw_tools
        .into_iter()
        .filter(|raw| {
            let Some(spec) = serde_json::from_value::<ToolSpec>(raw.clone()).ok() else { return true };
            filtered_tools.regular_tools.iter().any(|t| t.name == spec.name && t.kind == spec.kind)
        })
        .collect();
    request.tools = if forwarded_tools.is_empty() { None } else { Some(forwarded_tools) };

    if filtered_tools.has_web_search
        && let Some(query) = last_user_text(&request).filter(|text| server_tools::detect_search_intent(text))
    {
        match server_tools::execute_search(&state.http_client, &query, &state.config.search).await {
            Ok(results) => {
                let context_block = server_tools::format_results_for_context(&query, &results);
                append_to_last_user_message(&mut request, &context_block);
            },
            Err(e) => {
                tracing::warn!(error = %e, "server-side search failed, proceeding without results");
            },
        }
    }

    // Step 4: tool-instruction injection for local/client-declared tools.
    let keyword_tools: Vec<tool_injector::ToolKeywords> = filtered_tools
        .regular_tools
        .iter()
        .filter_map(|tool| match tool.name.to_lowercase().as_str() {
            "webfetch" | "web_fetch" => Some(tool_injector::web_fetch_keywords()),
            "read" => Some(tool_injector::read_keywords()),
            _ => None,
        })
        .collect();

    if !keyword_tools.is_empty()
        && let Some(message_text) = last_user_text(&request)
    {
        let conversation_key =
            headers.get("x-conversation-id").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
        let current_count = state.injection_counts.get(&conversation_key).map(|v| *v.value()).unwrap_or(0);
        let injector_config = InjectorConfig {
            enabled: state.config.tool_injection.enabled,
            style: if state.config.tool_injection.style == "explicit" {
                InjectionStyle::Explicit
            } else {
                InjectionStyle::Subtle
            },
            confidence_threshold: state.config.tool_injection.confidence_threshold,
            max_injections_per_conversation: state.config.tool_injection.max_injections_per_conversation,
        };

        let injection = tool_injector::inject(&message_text, &keyword_tools, &injector_config, current_count);
        if injection.modified {
            state.injection_counts.insert(conversation_key, injection.injection_count);
            let addition = injection.modified_message.strip_prefix(&message_text).unwrap_or("").trim_start();
            if !addition.is_empty() {
                append_to_last_user_message(&mut request, addition);
            }
        }
    }

    // Step 5: translate to the OpenAI chat-completions shape.
    let openai_request = match translator::translate_request(&request, BackendQuirks::default()) {
        Ok(body) => body,
        Err(e) => return ApiError::invalid_request(e.to_string()).into_response(),
    };

    // Step 6: pick a node.
    let context = RoutingContext {
        system_prompt_hash: stable_hash(&filter_result.filtered_prompt),
        tools_hash: stable_hash(&openai_request.get("tools").cloned().unwrap_or(Value::Null).to_string()),
        request_tokens: safe_filter::estimate_tokens(&filter_result.filtered_prompt),
        session_id: headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
    };

    let Some(decision) = state.cluster.select_node(&context).await else {
        let checked = state.cluster.node_count().await;
        return ApiError::overloaded(format!(
            "No healthy cluster nodes available ({checked} node(s) checked)"
        ))
        .into_response();
    };

    // Step 7: resolve its provider.
    let Some(provider) = state.cluster.get_node_provider(&decision.node_id).await else {
        return ApiError::api(format!(
            "no provider registered for node '{}' selected by the router",
            decision.node_id
        ))
        .into_response();
    };

    let breaker = state.circuit_breaker_for(&decision.node_id);
    if !breaker.allow_request() {
        return ApiError::overloaded(format!("circuit breaker is open for node '{}'", decision.node_id))
            .into_response();
    }

    // Step 8: issue the upstream request, streaming or not.
    let start = Instant::now();
    if request.stream {
        match provider.chat_stream(&openai_request).await {
            Ok(upstream) => {
                let events = bridge_stream(
                    upstream,
                    state.clone(),
                    decision.node_id.clone(),
                    breaker,
                    start,
                    context.system_prompt_hash,
                    context.request_tokens,
                );
                Sse::new(events).into_response()
            },
            Err(e) => {
                breaker.record_failure();
                state.cluster.record_node_failure(&decision.node_id).await;
                ApiError::api(format!("upstream node '{}' failed: {e}", decision.node_id)).into_response()
            },
        }
    } else {
        match provider.chat(&openai_request).await {
            Ok(openai_response) => {
                let latency = start.elapsed();
                breaker.record_success(latency);
                state.cluster.record_node_success(&decision.node_id, latency).await;
                state
                    .cluster
                    .record_node_cache(&decision.node_id, context.system_prompt_hash, context.request_tokens)
                    .await;
                axum::response::Json(translator::translate_response(&openai_response, &request.model))
                    .into_response()
            },
            Err(e) => {
                breaker.record_failure();
                state.cluster.record_node_failure(&decision.node_id).await;
                ApiError::api(format!("upstream node '{}' failed: {e}", decision.node_id)).into_response()
            },
        }
    }
}

fn resolve_tier(headers: &HeaderMap, default_tier: &str) -> Tier {
    headers
        .get("x-filter-tier")
        .and_then(|v| v.to_str().ok())
        .and_then(tier_from_str)
        .or_else(|| tier_from_str(default_tier))
        .unwrap_or(Tier::Moderate)
}

fn tier_from_str(name: &str) -> Option<Tier> {
    match name.to_lowercase().as_str() {
        "minimal" => Some(Tier::Minimal),
        "moderate" => Some(Tier::Moderate),
        "aggressive" => Some(Tier::Aggressive),
        "extreme" => Some(Tier::Extreme),
        _ => None,
    }
}

fn system_text_of(system: &AnthropicSystem) -> String {
    match system {
        AnthropicSystem::Text(text) => text.clone(),
        AnthropicSystem::Blocks(blocks) => {
            blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n\n")
        },
    }
}

fn last_user_text(request: &AnthropicRequest) -> Option<String> {
    let message = request.messages.iter().rev().find(|m| m.role == "user")?;
    Some(match &message.content {
        AnthropicContent::Text(text) => text.clone(),
        AnthropicContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                crate::translator::AnthropicContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    })
}

fn append_to_last_user_message(request: &mut AnthropicRequest, addition: &str) {
    let Some(message) = request.messages.iter_mut().rev().find(|m| m.role == "user") else { return };
    match &mut message.content {
        AnthropicContent::Text(text) => {
            *text = format!("{text}\n\n{addition}");
        },
        AnthropicContent::Blocks(blocks) => {
            blocks.push(crate::translator::AnthropicContentBlock::Text { text: addition.to_string() });
        },
    }
}

fn stable_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn to_sse_event(event: &AnthropicStreamEvent) -> Event {
    match Event::default().event(event.event_name()).json_data(event) {
        Ok(sse_event) => sse_event,
        Err(_) => Event::default().event("error").data("{\"type\":\"error\"}"),
    }
}

/// Pulls raw SSE byte chunks off the upstream OpenAI stream, reassembles
/// them into Anthropic events, and records the outcome once the stream
/// ends (cancellation included — dropping this stream early still leaves
/// the breaker/health state as the last recorded outcome).
fn bridge_stream(
    upstream: ChatStream,
    state: AppState,
    node_id: String,
    breaker: crate::circuit_breaker::CircuitBreaker,
    start: Instant,
    system_prompt_hash: u64,
    request_tokens: usize,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    struct BridgeState {
        upstream: ChatStream,
        buffer: String,
        assembler: StreamAssembler,
        pending: VecDeque<Event>,
        finished: bool,
        failed: bool,
    }

    let initial = BridgeState {
        upstream,
        buffer: String::new(),
        assembler: StreamAssembler::new(),
        pending: VecDeque::new(),
        finished: false,
        failed: false,
    };

    stream::unfold(initial, move |mut st| {
        let state = state.clone();
        let node_id = node_id.clone();
        let breaker = breaker.clone();
        async move {
            loop {
                if let Some(event) = st.pending.pop_front() {
                    return Some((Ok(event), st));
                }
                if st.finished {
                    if st.failed {
                        breaker.record_failure();
                        state.cluster.record_node_failure(&node_id).await;
                    } else {
                        let latency = start.elapsed();
                        breaker.record_success(latency);
                        state.cluster.record_node_success(&node_id, latency).await;
                        state.cluster.record_node_cache(&node_id, system_prompt_hash, request_tokens).await;
                    }
                    return None;
                }

                match st.upstream.next().await {
                    Some(Ok(bytes)) => {
                        st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = st.buffer.find("\n\n") {
                            let chunk: String = st.buffer.drain(..pos + 2).collect();
                            for line in chunk.lines() {
                                let Some(data) = line.strip_prefix("data: ") else { continue };
                                if data == "[DONE]" {
                                    st.finished = true;
                                    if let Ok(events) = st.assembler.finish("end_turn", json!({})) {
                                        st.pending.extend(events.iter().map(to_sse_event));
                                    }
                                    continue;
                                }
                                if let Ok(chunk_value) = serde_json::from_str::<Value>(data)
                                    && let Ok(events) = st.assembler.push_openai_delta(&chunk_value)
                                {
                                    st.pending.extend(events.iter().map(to_sse_event));
                                }
                            }
                        }
                    },
                    Some(Err(_)) => {
                        st.finished = true;
                        st.failed = true;
                    },
                    None => {
                        st.finished = true;
                    },
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::{AnthropicContentBlock, AnthropicMessage};

    fn request_with_user_text(text: &str) -> AnthropicRequest {
        AnthropicRequest {
            model: "claude-3-opus".to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: AnthropicContent::Text(text.to_string()),
            }],
            system: None,
            max_tokens: 100,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            tools: None,
        }
    }

    #[test]
    fn tier_from_str_parses_all_four_tiers() {
        assert_eq!(tier_from_str("minimal"), Some(Tier::Minimal));
        assert_eq!(tier_from_str("MODERATE"), Some(Tier::Moderate));
        assert_eq!(tier_from_str("Aggressive"), Some(Tier::Aggressive));
        assert_eq!(tier_from_str("extreme"), Some(Tier::Extreme));
        assert_eq!(tier_from_str("bogus"), None);
    }

    #[test]
    fn last_user_text_prefers_most_recent_user_message() {
        let mut request = request_with_user_text("first");
        request.messages.push(AnthropicMessage {
            role: "assistant".to_string(),
            content: AnthropicContent::Text("reply".to_string()),
        });
        request.messages.push(AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Text("second".to_string()),
        });
        assert_eq!(last_user_text(&request), Some("second".to_string()));
    }

    #[test]
    fn append_to_last_user_message_extends_text_variant() {
        let mut request = request_with_user_text("hello");
        append_to_last_user_message(&mut request, "extra context");
        assert_eq!(last_user_text(&request), Some("hello\n\nextra context".to_string()));
    }

    #[test]
    fn append_to_last_user_message_adds_a_block_for_block_variant() {
        let mut request = request_with_user_text("unused");
        request.messages[0].content =
            AnthropicContent::Blocks(vec![AnthropicContentBlock::Text { text: "hi".to_string() }]);
        append_to_last_user_message(&mut request, "more");
        assert_eq!(last_user_text(&request), Some("hi\nmore".to_string()));
    }

    #[test]
    fn stable_hash_is_deterministic_for_equal_inputs() {
        assert_eq!(stable_hash(&"same text".to_string()), stable_hash(&"same text".to_string()));
        assert_ne!(stable_hash(&"a".to_string()), stable_hash(&"b".to_string()));
    }
}
