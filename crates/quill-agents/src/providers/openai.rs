use crate::classify;
use crate::keypool::KeyPool;
use crate::providers::{ChatProvider, ChatRequest, EventStream, StreamEvent, MAX_KEY_RETRIES};
use crate::tools::default_tool_definitions;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, TryStreamExt};
use quill_common::{ChatTurn, Error, Result, Role};
use quill_config::ProviderId;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Adapter for the OpenAI chat-completions wire protocol, shared by OpenAI
/// itself and the compatible hosts (Groq, OpenRouter) via the base URL.
pub struct OpenAiCompatProvider {
    provider_id: String,
    base_url: String,
    pool: Arc<KeyPool>,
    client: Client,
    inject_default_tools: bool,
}

impl OpenAiCompatProvider {
    pub fn new(provider: ProviderId, pool: Arc<KeyPool>) -> Self {
        Self {
            provider_id: provider.as_str().to_string(),
            base_url: provider.default_base_url().to_string(),
            pool,
            client: Client::new(),
            // Groq's gpt-oss models reject requests without a tool list.
            inject_default_tools: provider == ProviderId::Groq,
        }
    }

    pub fn openai(pool: Arc<KeyPool>) -> Self {
        Self::new(ProviderId::OpenAi, pool)
    }

    pub fn groq(pool: Arc<KeyPool>) -> Self {
        Self::new(ProviderId::Groq, pool)
    }

    pub fn openrouter(pool: Arc<KeyPool>) -> Self {
        Self::new(ProviderId::OpenRouter, pool)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request.turns.iter().map(convert_turn).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });

        let mut tools = request.tools.clone();
        if tools.is_empty()
            && self.inject_default_tools
            && request.model.starts_with("openai/gpt-oss")
        {
            tools = default_tool_definitions();
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = json!("auto");
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn convert_turn(turn: &ChatTurn) -> Value {
    match turn.role {
        Role::System => json!({"role": "system", "content": turn.content}),
        Role::User => json!({"role": "user", "content": turn.content}),
        Role::Assistant => {
            let mut msg = json!({"role": "assistant", "content": turn.content});
            if !turn.tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(
                    turn.tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {"name": c.name, "arguments": c.arguments},
                            })
                        })
                        .collect(),
                );
            }
            msg
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id,
            "content": turn.content,
        }),
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = Error::Auth {
            provider: self.provider_id.clone(),
            message: "no usable API keys".into(),
        };

        for attempt in 0..MAX_KEY_RETRIES {
            let Some(key) = self.pool.current_key() else {
                return Err(last_error);
            };

            let response = match self.client.post(&url).bearer_auth(&key).json(&body).send().await
            {
                Ok(response) => response,
                Err(e) => {
                    let msg = format!("request failed: {e}");
                    warn!(provider = self.provider_id, attempt, "{msg}");
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
                    // Rotating keys cannot shrink the prompt.
                    return Err(Error::ContextOverflow(msg));
                }
                debug!(provider = self.provider_id, attempt, "error response: {msg}");
                self.pool.report_error(&key, &msg);
                last_error = classify::classified_error(&self.provider_id, &msg);
                continue;
            }

            self.pool.report_success(&key);
            let bytes: BoxStream<'static, Result<Bytes>> = Box::pin(
                response
                    .bytes_stream()
                    .map_err(|e| Error::Agent(format!("stream error: {e}"))),
            );
            return Ok(Box::pin(SseEventStream::new(bytes)));
        }

        Err(last_error)
    }

    async fn is_available(&self) -> bool {
        self.pool.healthy_count() > 0
    }
}

/// Incremental SSE parser over the raw byte stream, yielding canonical
/// events. Frames are `data: {json}` lines; `[DONE]` ends the stream.
struct SseEventStream {
    inner: BoxStream<'static, Result<Bytes>>,
    buffer: Vec<u8>,
    queue: VecDeque<Result<StreamEvent>>,
    done: bool,
}

impl SseEventStream {
    fn new(inner: BoxStream<'static, Result<Bytes>>) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(0..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                self.done = true;
                return;
            }
            match serde_json::from_str::<StreamChunk>(payload) {
                Ok(chunk) => self.queue.extend(chunk_events(chunk).into_iter().map(Ok)),
                Err(e) => self
                    .queue
                    .push_back(Err(Error::Protocol(format!("bad stream chunk: {e}")))),
            }
        }
    }
}

impl Stream for SseEventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.queue.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                    this.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallChunk>,
    #[serde(default)]
    executed_tools: Vec<ExecutedToolChunk>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct ExecutedToolChunk {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    name: Option<String>,
    output: Option<String>,
}

fn chunk_events(chunk: StreamChunk) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.reasoning {
            if !text.is_empty() {
                events.push(StreamEvent::ReasoningDelta { text });
            }
        }
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                events.push(StreamEvent::ContentDelta { text });
            }
        }
        for call in choice.delta.tool_calls {
            let (name, arguments) = match call.function {
                Some(f) => (f.name, f.arguments),
                None => (None, None),
            };
            events.push(StreamEvent::ToolCallDelta {
                index: call.index,
                id: call.id,
                name,
                arguments,
            });
        }
        for tool in choice.delta.executed_tools {
            if let Some(output) = tool.output {
                events.push(StreamEvent::ExecutedToolResult {
                    name: tool.name.or(tool.kind).unwrap_or_else(|| "tool".into()),
                    output,
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(StreamEvent::FinishReason { reason });
        }
    }
    events
}
