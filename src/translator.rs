//! Anthropic Messages wire format ↔ OpenAI chat-completions wire format.
//!
//! Request direction collapses Anthropic's `system` into a leading
//! `system`-role message and maps tool-result blocks to `role: "tool"`.
//! Response direction assembles Anthropic SSE events from OpenAI streaming
//! deltas. Both directions are pure: no shared mutable state, no I/O.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("invalid base64 in content block: {0}")]
    InvalidBase64(String),
    #[error("document exceeds max size of {max} bytes (got {actual})")]
    DocumentTooLarge { max: usize, actual: usize },
    #[error("unknown message role: {0}")]
    UnknownRole(String),
    #[error("malformed tool-call arguments at content block stop: {0}")]
    MalformedToolArguments(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicSystem {
    Text(String),
    Blocks(Vec<AnthropicSystemBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicSystemBlock {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSource {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default)]
    pub system: Option<AnthropicSystem>,
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
}

/// Quirks a particular backend needs applied to the outbound OpenAI payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendQuirks {
    /// Collapse whitespace and strip newlines from the outbound system
    /// message so strict-JSON local servers don't choke on embedded
    /// newlines. Only ever applied to the system role.
    pub normalize_system_whitespace: bool,
}

const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

fn system_text(system: &AnthropicSystem) -> String {
    match system {
        AnthropicSystem::Text(text) => text.clone(),
        AnthropicSystem::Blocks(blocks) => {
            blocks.iter().map(|b| b.text.as_str()).collect::<Vec<_>>().join("\n\n")
        },
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn content_block_to_openai(block: &AnthropicContentBlock) -> Result<Value, TranslateError> {
    match block {
        AnthropicContentBlock::Text { text } => Ok(json!({ "type": "text", "text": text })),
        AnthropicContentBlock::Image { source } => {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(&source.data)
                .map_err(|e| TranslateError::InvalidBase64(e.to_string()))?;
            if decoded.len() > MAX_DOCUMENT_BYTES {
                return Err(TranslateError::DocumentTooLarge {
                    max: MAX_DOCUMENT_BYTES,
                    actual: decoded.len(),
                });
            }
            Ok(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{};base64,{}", source.media_type, source.data) },
            }))
        },
        AnthropicContentBlock::ToolUse { .. } | AnthropicContentBlock::ToolResult { .. } => {
            unreachable!("tool_use/tool_result are handled at the message level")
        },
    }
}

fn tool_result_text(content: &ToolResultContent) -> String {
    match content {
        ToolResultContent::Text(text) => text.clone(),
        ToolResultContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                AnthropicContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Anthropic → OpenAI chat-completions request body.
pub fn translate_request(request: &AnthropicRequest, quirks: BackendQuirks) -> Result<Value, TranslateError> {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let mut text = system_text(system);
        if quirks.normalize_system_whitespace {
            text = normalize_whitespace(&text);
        }
        messages.push(json!({ "role": "system", "content": text }));
    }

    for message in &request.messages {
        match &message.content {
            AnthropicContent::Text(text) => {
                messages.push(json!({ "role": translate_role(&message.role)?, "content": text }));
            },
            AnthropicContent::Blocks(blocks) => {
                let mut tool_calls = Vec::new();
                let mut content_parts = Vec::new();

                for block in blocks {
                    match block {
                        AnthropicContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": { "name": name, "arguments": input.to_string() },
                            }));
                        },
                        AnthropicContentBlock::ToolResult { tool_use_id, content } => {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": tool_result_text(content),
                            }));
                        },
                        other => content_parts.push(content_block_to_openai(other)?),
                    }
                }

                if !content_parts.is_empty() || !tool_calls.is_empty() {
                    let mut entry = json!({ "role": translate_role(&message.role)? });
                    let obj = entry.as_object_mut().expect("object literal");
                    if !content_parts.is_empty() {
                        obj.insert("content".to_string(), Value::Array(content_parts));
                    }
                    if !tool_calls.is_empty() {
                        obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
                    }
                    messages.push(entry);
                }
            },
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "stream": request.stream,
    });
    let obj = body.as_object_mut().expect("object literal");
    if let Some(temperature) = request.temperature {
        obj.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        obj.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop_sequences {
        obj.insert("stop".to_string(), json!(stop));
    }
    if let Some(tools) = &request.tools {
        obj.insert("tools".to_string(), json!(tools));
    }

    Ok(body)
}

fn translate_role(role: &str) -> Result<&'static str, TranslateError> {
    match role {
        "user" => Ok("user"),
        "assistant" => Ok("assistant"),
        other => Err(TranslateError::UnknownRole(other.to_string())),
    }
}

/// Anthropic SSE event names, in the order the pipeline emits them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnthropicStreamEvent {
    MessageStart {
        message: Value,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Value,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: Value,
        usage: Value,
    },
    MessageStop,
}

impl AnthropicStreamEvent {
    /// The SSE `event:` line value, matching the wire protocol's event names.
    pub fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
        }
    }
}

/// Non-streaming OpenAI chat-completion response → an Anthropic `message`.
pub fn translate_response(openai: &Value, model: &str) -> Value {
    let message = openai.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("message"));
    let mut content = Vec::new();

    if let Some(text) = message.and_then(|m| m.get("content")).and_then(|c| c.as_str())
        && !text.is_empty()
    {
        content.push(json!({ "type": "text", "text": text }));
    }

    if let Some(tool_calls) = message.and_then(|m| m.get("tool_calls")).and_then(|t| t.as_array()) {
        for call in tool_calls {
            let input = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.get("function").and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                "input": input,
            }));
        }
    }

    let stop_reason = openai
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str())
        .map(translate_stop_reason)
        .unwrap_or("end_turn");

    let usage = openai.get("usage").cloned().unwrap_or_else(|| json!({}));

    json!({
        "id": openai.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(json!(0)),
        },
    })
}

fn translate_stop_reason(openai_reason: &str) -> &'static str {
    match openai_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

/// Incremental state for one streamed response: tracks which content block
/// index is open and whether it is a text block or a tool-use block so
/// deltas are framed correctly and tool arguments can be validated at stop.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    open_index: Option<usize>,
    next_index: usize,
    open_is_tool_use: bool,
    tool_call_buffer: String,
    message_started: bool,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one parsed OpenAI streaming chunk (`choices[0].delta`) and
    /// return the Anthropic events it produces, in emission order.
    pub fn push_openai_delta(&mut self, chunk: &Value) -> Result<Vec<AnthropicStreamEvent>, TranslateError> {
        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            events.push(AnthropicStreamEvent::MessageStart {
                message: json!({ "id": "", "type": "message", "role": "assistant", "content": [] }),
            });
        }

        let Some(delta) = chunk.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta")) else {
            return Ok(events);
        };

        if let Some(text) = delta.get("content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            if self.open_index.is_none() || self.open_is_tool_use {
                self.close_open_block(&mut events);
                self.open_new_text_block(&mut events);
            }
            events.push(AnthropicStreamEvent::ContentBlockDelta {
                index: self.open_index.unwrap(),
                delta: json!({ "type": "text_delta", "text": text }),
            });
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                if let Some(function) = call.get("function") {
                    if call.get("id").is_some() {
                        self.close_open_block(&mut events);
                        self.open_new_tool_use_block(&mut events, call, function);
                    }
                    if let Some(fragment) = function.get("arguments").and_then(|a| a.as_str()) {
                        self.tool_call_buffer.push_str(fragment);
                        events.push(AnthropicStreamEvent::ContentBlockDelta {
                            index: self.open_index.unwrap_or(self.next_index.saturating_sub(1)),
                            delta: json!({ "type": "input_json_delta", "partial_json": fragment }),
                        });
                    }
                }
            }
        }

        Ok(events)
    }

    fn open_new_text_block(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        let index = self.next_index;
        self.next_index += 1;
        self.open_index = Some(index);
        self.open_is_tool_use = false;
        events.push(AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block: json!({ "type": "text", "text": "" }),
        });
    }

    fn open_new_tool_use_block(&mut self, events: &mut Vec<AnthropicStreamEvent>, call: &Value, function: &Value) {
        let index = self.next_index;
        self.next_index += 1;
        self.open_index = Some(index);
        self.open_is_tool_use = true;
        self.tool_call_buffer.clear();
        events.push(AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block: json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": function.get("name").cloned().unwrap_or(Value::Null),
                "input": {},
            }),
        });
    }

    fn close_open_block(&mut self, events: &mut Vec<AnthropicStreamEvent>) {
        if let Some(index) = self.open_index.take() {
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }

    /// Finalize the stream: close any open block, validating tool-call JSON,
    /// then emit `message_delta`/`message_stop`.
    pub fn finish(
        &mut self,
        stop_reason: &str,
        usage: Value,
    ) -> Result<Vec<AnthropicStreamEvent>, TranslateError> {
        let mut events = Vec::new();

        if self.open_is_tool_use && !self.tool_call_buffer.is_empty() {
            serde_json::from_str::<Value>(&self.tool_call_buffer)
                .map_err(|e| TranslateError::MalformedToolArguments(e.to_string()))?;
        }
        self.close_open_block(&mut events);

        events.push(AnthropicStreamEvent::MessageDelta {
            delta: json!({ "stop_reason": stop_reason }),
            usage,
        });
        events.push(AnthropicStreamEvent::MessageStop);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> AnthropicRequest {
        AnthropicRequest {
            model: "claude-3-opus".to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: AnthropicContent::Text("hello".to_string()),
            }],
            system: Some(AnthropicSystem::Text("be concise".to_string())),
            max_tokens: 256,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            tools: None,
        }
    }

    #[test]
    fn system_collapses_to_a_leading_system_message() {
        let body = translate_request(&sample_request(), BackendQuirks::default()).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be concise");
        assert_eq!(messages[1]["role"], "user");
    }

    #[test]
    fn system_whitespace_normalized_only_when_quirk_enabled() {
        let mut request = sample_request();
        request.system = Some(AnthropicSystem::Text("line one\nline two   three".to_string()));

        let plain = translate_request(&request, BackendQuirks::default()).unwrap();
        assert_eq!(plain["messages"][0]["content"], "line one\nline two   three");

        let normalized =
            translate_request(&request, BackendQuirks { normalize_system_whitespace: true }).unwrap();
        assert_eq!(normalized["messages"][0]["content"], "line one line two three");
    }

    #[test]
    fn tool_result_block_becomes_tool_role_message() {
        let mut request = sample_request();
        request.messages.push(AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Blocks(vec![AnthropicContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: ToolResultContent::Text("42".to_string()),
            }]),
        });

        let body = translate_request(&request, BackendQuirks::default()).unwrap();
        let messages = body["messages"].as_array().unwrap();
        let tool_message = messages.last().unwrap();
        assert_eq!(tool_message["role"], "tool");
        assert_eq!(tool_message["tool_call_id"], "call_1");
        assert_eq!(tool_message["content"], "42");
    }

    #[test]
    fn invalid_base64_image_is_rejected() {
        let mut request = sample_request();
        request.messages.push(AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Blocks(vec![AnthropicContentBlock::Image {
                source: ImageSource { media_type: "image/png".to_string(), data: "not-base64!!".to_string() },
            }]),
        });

        let err = translate_request(&request, BackendQuirks::default()).unwrap_err();
        assert!(matches!(err, TranslateError::InvalidBase64(_)));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let mut request = sample_request();
        request.messages[0].role = "narrator".to_string();
        let err = translate_request(&request, BackendQuirks::default()).unwrap_err();
        assert!(matches!(err, TranslateError::UnknownRole(_)));
    }

    #[test]
    fn streaming_text_delta_opens_and_closes_one_content_block() {
        let mut assembler = StreamAssembler::new();
        let events = assembler
            .push_openai_delta(&json!({ "choices": [{ "delta": { "content": "hi" } }] }))
            .unwrap();
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));

        let finish = assembler.finish("end_turn", json!({ "output_tokens": 1 })).unwrap();
        assert!(matches!(finish[0], AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(finish[1], AnthropicStreamEvent::MessageDelta { .. }));
        assert!(matches!(finish[2], AnthropicStreamEvent::MessageStop));
    }

    #[test]
    fn malformed_tool_arguments_rejected_at_stop() {
        let mut assembler = StreamAssembler::new();
        assembler
            .push_openai_delta(&json!({
                "choices": [{ "delta": { "tool_calls": [{
                    "id": "call_1",
                    "function": { "name": "search", "arguments": "{not json" },
                }] } }],
            }))
            .unwrap();

        let err = assembler.finish("tool_use", json!({})).unwrap_err();
        assert!(matches!(err, TranslateError::MalformedToolArguments(_)));
    }

    #[test]
    fn translate_response_maps_text_completion() {
        let openai = json!({
            "id": "chatcmpl-1",
            "choices": [{ "message": { "role": "assistant", "content": "hi there" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 3 },
        });
        let anthropic = translate_response(&openai, "claude-3-opus");
        assert_eq!(anthropic["type"], "message");
        assert_eq!(anthropic["content"][0]["type"], "text");
        assert_eq!(anthropic["content"][0]["text"], "hi there");
        assert_eq!(anthropic["stop_reason"], "end_turn");
        assert_eq!(anthropic["usage"]["input_tokens"], 10);
        assert_eq!(anthropic["usage"]["output_tokens"], 3);
    }

    #[test]
    fn translate_response_maps_tool_call_completion() {
        let openai = json!({
            "id": "chatcmpl-2",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "search", "arguments": "{\"q\":\"rust\"}" },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let anthropic = translate_response(&openai, "claude-3-opus");
        assert_eq!(anthropic["content"][0]["type"], "tool_use");
        assert_eq!(anthropic["content"][0]["name"], "search");
        assert_eq!(anthropic["content"][0]["input"]["q"], "rust");
        assert_eq!(anthropic["stop_reason"], "tool_use");
    }

    #[test]
    fn well_formed_tool_arguments_assembled_across_fragments() {
        let mut assembler = StreamAssembler::new();
        assembler
            .push_openai_delta(&json!({
                "choices": [{ "delta": { "tool_calls": [{
                    "id": "call_1",
                    "function": { "name": "search", "arguments": "{\"q\":" },
                }] } }],
            }))
            .unwrap();
        assembler
            .push_openai_delta(&json!({
                "choices": [{ "delta": { "tool_calls": [{
                    "function": { "arguments": "\"rust\"}" },
                }] } }],
            }))
            .unwrap();

        assembler.finish("tool_use", json!({})).unwrap();
    }
}
