use crate::providers::{ChatProvider, ChatRequest, EventStream, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use quill_common::{Error, Result, Role};
use quill_config::ProviderId;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Adapter for a local Ollama daemon. No API keys and no key pool; NDJSON
/// chat streaming over `/api/chat`. Tool calls are not forwarded: results
/// are flattened into plain user messages the local model can read.
pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or_else(|| ProviderId::Ollama.default_base_url().to_string()),
            client: Client::new(),
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .turns
            .iter()
            .map(|turn| match turn.role {
                Role::System => json!({"role": "system", "content": turn.content}),
                Role::User => json!({"role": "user", "content": turn.content}),
                // Local models get the text only; structured calls dropped.
                Role::Assistant => json!({"role": "assistant", "content": turn.content}),
                Role::Tool => json!({
                    "role": "user",
                    "content": format!("Tool result: {}", turn.content),
                }),
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });

        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("failed to list models: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Agent(format!(
                "ollama error status: {}",
                response.status()
            )));
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse models response: {e}")))?;
        Ok(models.models.into_iter().map(|m| m.name).collect())
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    content: String,
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream> {
        let body = self.build_body(request);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Agent(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Agent(format!(
                "ollama error status: {}",
                response.status()
            )));
        }

        let bytes: BoxStream<'static, Result<Bytes>> = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| Error::Agent(format!("stream error: {e}"))),
        );

        // NDJSON: one chunk per line.
        let state = (bytes, Vec::new(), VecDeque::new());
        let stream = futures::stream::try_unfold(
            state,
            |(mut bytes, mut buffer, mut queue): (
                BoxStream<'static, Result<Bytes>>,
                Vec<u8>,
                VecDeque<StreamEvent>,
            )| async move {
                loop {
                    if let Some(event) = queue.pop_front() {
                        return Ok(Some((event, (bytes, buffer, queue))));
                    }

                    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=pos).collect();
                        let line = String::from_utf8_lossy(&line_bytes);
                        let line = line.trim();
                        if !line.is_empty() {
                            queue.extend(parse_chunk(line)?);
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => return Err(e),
                        None => {
                            let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                            buffer.clear();
                            if !rest.is_empty() {
                                queue.extend(parse_chunk(&rest)?);
                                continue;
                            }
                            return Ok(None);
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn is_available(&self) -> bool {
        self.list_models().await.is_ok()
    }
}

fn parse_chunk(line: &str) -> Result<Vec<StreamEvent>> {
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("bad stream chunk: {e}")))?;
    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if !message.content.is_empty() {
            events.push(StreamEvent::ContentDelta {
                text: message.content,
            });
        }
    }
    if chunk.done {
        events.push(StreamEvent::FinishReason {
            reason: chunk.done_reason.unwrap_or_else(|| "stop".to_string()),
        });
    }
    Ok(events)
}
