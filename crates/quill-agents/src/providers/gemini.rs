use crate::args::parse_tool_arguments;
use crate::classify;
use crate::keypool::KeyPool;
use crate::providers::{ChatProvider, ChatRequest, EventStream, StreamEvent, MAX_KEY_RETRIES};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use quill_common::{Error, Result, Role};
use quill_config::ProviderId;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Adapter for Gemini's `streamGenerateContent` endpoint. Assistant turns
/// map to the `model` role, tool calls to `functionCall` parts and tool
/// results to `functionResponse` parts.
pub struct GeminiProvider {
    base_url: String,
    pool: Arc<KeyPool>,
    client: Client,
}

impl GeminiProvider {
    pub fn new(pool: Arc<KeyPool>) -> Self {
        Self {
            base_url: ProviderId::Google.default_base_url().to_string(),
            pool,
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_body(&self, request: &ChatRequest) -> Result<Value> {
        // functionResponse parts need the function name, which tool turns
        // don't carry; recover it from the calling assistant turn.
        let mut call_names: HashMap<&str, &str> = HashMap::new();
        for turn in &request.turns {
            for call in &turn.tool_calls {
                call_names.insert(call.id.as_str(), call.name.as_str());
            }
        }

        let mut system_parts = Vec::new();
        let mut contents = Vec::new();

        for turn in &request.turns {
            match turn.role {
                Role::System => system_parts.push(turn.content.clone()),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": turn.content}],
                })),
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !turn.content.is_empty() {
                        parts.push(json!({"text": turn.content}));
                    }
                    for call in &turn.tool_calls {
                        let args = parse_tool_arguments(&call.arguments)?;
                        parts.push(json!({
                            "functionCall": {"name": call.name, "args": args},
                        }));
                    }
                    if parts.is_empty() {
                        continue;
                    }
                    contents.push(json!({"role": "model", "parts": parts}));
                }
                Role::Tool => {
                    let name = turn
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| call_names.get(id).copied())
                        .unwrap_or("tool");
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": name,
                                "response": {"content": turn.content},
                            },
                        }],
                    }));
                }
            }
        }

        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": system_parts.join("\n\n")}],
            });
        }
        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        })
                    })
                    .collect::<Vec<_>>(),
            }]);
        }
        let mut generation = serde_json::Map::new();
        if let Some(max_tokens) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn provider_id(&self) -> &str {
        "google"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request)?;
        let mut last_error = Error::Auth {
            provider: "google".into(),
            message: "no usable API keys".into(),
        };

        for attempt in 0..MAX_KEY_RETRIES {
            let Some(key) = self.pool.current_key() else {
                return Err(last_error);
            };
            let url = format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, request.model, key
            );

            let response = match self.client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    let msg = format!("request failed: {e}");
                    warn!(provider = "google", attempt, "{msg}");
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
                debug!(provider = "google", attempt, "error response: {msg}");
                self.pool.report_error(&key, &msg);
                last_error = classify::classified_error("google", &msg);
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
    /// Gemini sends each functionCall whole; number them in arrival order.
    next_call_index: usize,
}

fn event_stream(
    bytes: BoxStream<'static, Result<Bytes>>,
) -> impl futures::Stream<Item = Result<StreamEvent>> + Send {
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        queue: VecDeque::new(),
        next_call_index: 0,
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
                    let events = parse_event(payload, &mut st.next_call_index)?;
                    st.queue.extend(events);
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

fn parse_event(payload: &str, next_call_index: &mut usize) -> Result<Vec<StreamEvent>> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| Error::Protocol(format!("bad stream event: {e}")))?;
    let mut events = Vec::new();

    let Some(candidate) = value["candidates"].get(0) else {
        return Ok(events);
    };
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(StreamEvent::ContentDelta { text: text.to_string() });
                }
            }
            if let Some(call) = part.get("functionCall") {
                let index = *next_call_index;
                *next_call_index += 1;
                events.push(StreamEvent::ToolCallDelta {
                    index,
                    id: None,
                    name: call["name"].as_str().map(String::from),
                    arguments: Some(call["args"].to_string()),
                });
            }
        }
    }
    if let Some(reason) = candidate["finishReason"].as_str() {
        events.push(StreamEvent::FinishReason {
            reason: reason.to_string(),
        });
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::{ChatTurn, ToolCall};
    use quill_config::RotationMode;

    fn provider() -> GeminiProvider {
        let pool = Arc::new(KeyPool::from_keys(
            "google",
            RotationMode::Sequential,
            ["AIzaTest11112222"],
        ));
        GeminiProvider::new(pool)
    }

    #[test]
    fn assistant_turns_use_the_model_role() {
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatTurn::system("be terse"),
                ChatTurn::user("hi"),
                ChatTurn::assistant("hello"),
            ],
        );
        let body = provider().build_body(&request).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn tool_round_trips_map_to_function_parts() {
        let request = ChatRequest::new(
            "gemini-2.0-flash",
            vec![
                ChatTurn::assistant_with_tools(
                    "",
                    vec![ToolCall::new("call_0", "read_file", r#"{"path":"a.rs"}"#)],
                ),
                ChatTurn::tool("call_0", "fn main() {}"),
            ],
        );
        let body = provider().build_body(&request).unwrap();

        let call = &body["contents"][0]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "read_file");
        assert_eq!(call["args"]["path"], "a.rs");

        let response = &body["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "read_file");
        assert_eq!(response["response"]["content"], "fn main() {}");
    }

    #[test]
    fn function_calls_arrive_whole_with_increasing_indexes() {
        let mut next = 0;
        let payload = r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"read_file","args":{"path":"a.rs"}}},{"functionCall":{"name":"run_command","args":{"command":"ls"}}}]},"finishReason":"STOP"}]}"#;
        let events = parse_event(payload, &mut next).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            StreamEvent::ToolCallDelta { index: 0, name: Some(n), .. } if n == "read_file"
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::ToolCallDelta { index: 1, name: Some(n), .. } if n == "run_command"
        ));
        assert!(matches!(&events[2], StreamEvent::FinishReason { reason } if reason == "STOP"));
    }
}
