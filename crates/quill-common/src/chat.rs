use serde::{Deserialize, Serialize};

/// One turn of a conversation in the canonical (OpenAI-flavoured) shape.
/// Provider adapters convert to and from their native wire formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    /// Populated on assistant turns that requested tool execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Populated on tool turns; pairs the result with the call that produced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model. `arguments` is the raw JSON
/// string as the provider produced it; parsing and repair happen downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Synthetic id for providers that stream fragments without one.
    pub fn fallback_id(index: usize) -> String {
        format!("call_{index}")
    }
}

/// Checks the assistant/tool pairing invariant over a transcript: every
/// assistant turn carrying tool calls must be immediately followed by one
/// tool turn per call, matched by id, in call order.
pub fn tool_pairing_holds(turns: &[ChatTurn]) -> bool {
    let mut i = 0;
    while i < turns.len() {
        let turn = &turns[i];
        if turn.role == Role::Assistant && !turn.tool_calls.is_empty() {
            for (offset, call) in turn.tool_calls.iter().enumerate() {
                match turns.get(i + 1 + offset) {
                    Some(result)
                        if result.role == Role::Tool
                            && result.tool_call_id.as_deref() == Some(call.id.as_str()) => {}
                    _ => return false,
                }
            }
            i += 1 + turn.tool_calls.len();
        } else {
            if turn.role == Role::Tool && turn.tool_call_id.is_none() {
                return false;
            }
            i += 1;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_round_trips_through_json() {
        let turn = ChatTurn::assistant_with_tools(
            "",
            vec![ToolCall::new("call_0", "read_file", r#"{"path":"a.rs"}"#)],
        );
        let json = serde_json::to_string(&turn).unwrap();
        let back: ChatTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].name, "read_file");
        assert_eq!(back.tool_calls[0].arguments, r#"{"path":"a.rs"}"#);
    }

    #[test]
    fn plain_turns_omit_tool_fields() {
        let json = serde_json::to_string(&ChatTurn::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }

    #[test]
    fn pairing_accepts_matched_results_in_order() {
        let turns = vec![
            ChatTurn::user("go"),
            ChatTurn::assistant_with_tools(
                "",
                vec![
                    ToolCall::new("call_0", "a", "{}"),
                    ToolCall::new("call_1", "b", "{}"),
                ],
            ),
            ChatTurn::tool("call_0", "ok"),
            ChatTurn::tool("call_1", "ok"),
            ChatTurn::assistant("done"),
        ];
        assert!(tool_pairing_holds(&turns));
    }

    #[test]
    fn pairing_rejects_missing_or_reordered_results() {
        let mut turns = vec![
            ChatTurn::assistant_with_tools(
                "",
                vec![
                    ToolCall::new("call_0", "a", "{}"),
                    ToolCall::new("call_1", "b", "{}"),
                ],
            ),
            ChatTurn::tool("call_1", "ok"),
            ChatTurn::tool("call_0", "ok"),
        ];
        assert!(!tool_pairing_holds(&turns));
        turns.truncate(2);
        assert!(!tool_pairing_holds(&turns));
    }
}
