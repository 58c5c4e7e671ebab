use async_trait::async_trait;
use futures::Stream;
use quill_common::{ChatTurn, Result, ToolCall, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatProvider;

/// In-adapter key rotation budget for a single `stream_chat` call.
pub const MAX_KEY_RETRIES: usize = 3;

/// Trait every backend adapter implements. Adapters normalize their native
/// wire protocol into [`StreamEvent`]s and classify their own errors; key
/// rotation happens inside `stream_chat` and is invisible to callers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "groq", "ollama").
    fn provider_id(&self) -> &str;

    /// Open a streaming chat completion.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<EventStream>;

    /// Whether the backend is usable right now (keys present, host up).
    async fn is_available(&self) -> bool;
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, turns: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            turns,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Canonical stream event every adapter normalizes to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Visible answer text.
    ContentDelta { text: String },
    /// Model reasoning text, shown separately from the answer.
    ReasoningDelta { text: String },
    /// Fragment of a tool call. `index` keys the accumulation slot; the
    /// other fields arrive incrementally and may be absent on any fragment.
    ToolCallDelta {
        index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<String>,
    },
    /// Output of a tool the provider executed on its own side.
    ExecutedToolResult { name: String, output: String },
    /// Terminal event of a well-formed stream.
    FinishReason { reason: String },
}

/// Coalesces [`StreamEvent::ToolCallDelta`] fragments by stream index into
/// complete calls, surfaced once the stream finishes.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    slots: BTreeMap<usize, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let slot = self.slots.entry(index).or_default();
        if let Some(id) = id {
            if !id.is_empty() {
                slot.id = Some(id.to_string());
            }
        }
        if let Some(name) = name {
            slot.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            slot.arguments.push_str(arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Completed calls in stream-index order. Slots that never received a
    /// name are dropped; slots without an id get `call_{index}`.
    pub fn into_calls(self) -> Vec<ToolCall> {
        self.slots
            .into_iter()
            .filter(|(_, slot)| !slot.name.is_empty())
            .map(|(index, slot)| ToolCall {
                id: slot.id.unwrap_or_else(|| ToolCall::fallback_id(index)),
                name: slot.name,
                arguments: slot.arguments,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_coalesces_fragments_by_index() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, Some("call_abc"), Some("read_"), None);
        acc.apply(1, None, Some("run_command"), Some(r#"{"cmd":"#));
        acc.apply(0, None, Some("file"), Some(r#"{"path":"#));
        acc.apply(0, None, None, Some(r#""a.rs"}"#));
        acc.apply(1, None, None, Some(r#""ls"}"#));

        let calls = acc.into_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments, r#"{"path":"a.rs"}"#);
        assert_eq!(calls[1].id, "call_1");
        assert_eq!(calls[1].name, "run_command");
    }

    #[test]
    fn nameless_slots_are_dropped() {
        let mut acc = ToolCallAccumulator::new();
        acc.apply(0, None, None, Some("{}"));
        assert!(acc.into_calls().is_empty());
    }

    #[test]
    fn stream_events_serialize_tagged() {
        let ev = StreamEvent::ToolCallDelta {
            index: 2,
            id: None,
            name: Some("read_file".into()),
            arguments: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_call_delta");
        assert_eq!(json["index"], 2);
        assert!(json.get("id").is_none());
    }
}
