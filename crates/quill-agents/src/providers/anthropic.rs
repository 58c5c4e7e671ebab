use crate::args::parse_tool_arguments;
use crate::classify;
use crate::keypool::KeyPool;
use crate::providers::{ChatProvider, ChatRequest, EventStream, StreamEvent, MAX_KEY_RETRIES};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use quill_common::{ChatTurn, Error, Result, Role};
use quill_config::ProviderId;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Adapter for the Anthropic messages API. System turns move into the
/// `system` field, tool results become `tool_result` user blocks, and
/// assistant tool calls become `tool_use` blocks.
pub struct AnthropicProvider {
    base_url: String,
    pool: Arc<KeyPool>,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self {
            base_url: ProviderId::Anthropic.default_base_url().to_string(),
            pool,
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(&self, request: &ChatRequest) -> Result<Value> {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for turn in &request.turns {
            match turn.role {
                Role::System => system_parts.push(turn.content.clone()),
                Role::User => {
                    messages.push(json!({"role": "user", "content": turn.content}));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !turn.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": turn.content}));
                    }
                    for call in &turn.tool_calls {
                        let input = parse_tool_arguments(&call.arguments)?;
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    if blocks.is_empty() {
                        continue;
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": turn.tool_call_id,
                            "content": turn.content,
                        }],
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request)?;
        let url = format!("{}/v1/messages", self.base_url);
        let mut last_error = Error::Auth {
            provider: "anthropic".into(),
            message: "no usable API keys".into(),
        };

        for attempt in 0..MAX_KEY_RETRIES {
            let Some(key) = self.pool.current_key() else {
                return Err(last_error);
            };

            let response = match self
                .client
                .post(&url)
                .header("x-api-key", &key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let msg = format!("request failed: {e}");
                    warn!(provider = "anthropic", attempt, "{msg}");
                    self.pool.report_error(&key, &msg);
                    last_error = Error::Agent(msg);
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let msg = format!("{status}: {text}");
                if classify::is_context_overflow(&msg) {
                    return Err(Error::ContextOverflow(msg));
                }
                debug!(provider = "anthropic", attempt, "error response: {msg}");
                self.pool.report_error(&key, &msg);
                last_error = classify::classified_error("anthropic", &msg);
                continue;
            }

            self.pool.report_success(&key);
            let bytes: BoxStream<'static, Result<Bytes>> = Box::pin(
                response
                    .bytes_stream()
                    .map_err(|e| Error::Agent(format!("stream error: {e}"))),
            );
            return Ok(Box::pin(event_stream(bytes)));
        }

        Err(last_error)
    }

    async fn is_available(&self) -> bool {
        self.pool.healthy_count() > 0
    }
}

struct SseState {
    bytes: BoxStream<'static, Result<Bytes>>,
    buffer: Vec<u8>,
    queue: VecDeque<StreamEvent>,
}

fn event_stream(
    bytes: BoxStream<'static, Result<Bytes>>,
) -> impl futures::Stream<Item = Result<StreamEvent>> + Send {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        queue: VecDeque::new(),
    };

    futures::stream::try_unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                return Ok(Some((event, st)));
            }

            if let Some(pos) = st.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = st.buffer.drain(0..=pos).collect();
                let line = String::from_utf8_lossy(&line_bytes);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Some(payload) = line.strip_prefix("data: ") {
                    st.queue.extend(parse_event(payload)?);
                }
                continue;
            }

            match st.bytes.next().await {
                Some(Ok(chunk)) => st.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    })
}

/// Map one Anthropic SSE event onto canonical events. Tool-call indexes are
/// Anthropic's own content-block indexes, which already key the fragments.
fn parse_event(payload: &str) -> Result<Vec<StreamEvent>> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::Protocol(format!("bad stream event: {e}")))?;
    let mut events = Vec::new();

    match value["type"].as_str() {
        Some("content_block_start") => {
            let index = value["index"].as_u64().unwrap_or(0) as usize;
            let block = &value["content_block"];
            if block["type"] == "tool_use" {
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().map(String::from),
                    name: block["name"].as_str().map(String::from),
                    arguments: None,
                });
            }
        }
        Some("content_block_delta") => {
            let index = value["index"].as_u64().unwrap_or(0) as usize;
            let delta = &value["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => {
                    if let Some(text) = delta["text"].as_str() {
                        events.push(StreamEvent::ContentDelta { text: text.to_string() });
                    }
                }
                Some("thinking_delta") => {
                    if let Some(text) = delta["thinking"].as_str() {
                        events.push(StreamEvent::ReasoningDelta { text: text.to_string() });
                    }
                }
                Some("input_json_delta") => {
                    if let Some(partial) = delta["partial_json"].as_str() {
                        events.push(StreamEvent::ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            arguments: Some(partial.to_string()),
                        });
                    }
                }
                _ => {}
            }
        }
        Some("message_delta") => {
            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                events.push(StreamEvent::FinishReason { reason: reason.to_string() });
            }
        }
        // message_start, content_block_stop, message_stop, ping carry
        // nothing the canonical model needs.
        _ => {}
    }
    Ok(events)
}
