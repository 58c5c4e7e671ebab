//! Tool-argument parsing. Models emit argument JSON that is frequently
//! slightly broken: wrapped in code fences, cut off mid-object, or carrying
//! trailing commas. [`parse_tool_arguments`] is the single entry point; the
//! repair pass only runs when strict parsing fails, so valid JSON passes
//! through byte-identical.

use quill_common::{Error, Result, ToolCall};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

pub fn parse_tool_arguments(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let repaired = repair_json(trimmed);
    serde_json::from_str(&repaired).map_err(|e| {
        Error::Protocol(format!("unparseable tool arguments after repair: {e}: {trimmed}"))
    })
}

fn repair_json(raw: &str) -> String {
    let mut text = strip_code_fences(raw);

    // Anchor on the first opening brace; leading prose is common.
    if let Some(start) = text.find('{') {
        text = text[start..].to_string();
    }

    static TRAILING_COMMA: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());
    let mut text = TRAILING_COMMA.replace_all(&text, "$1").into_owned();

    // Close whatever the model left open, outside string context.
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut end = text.len();
    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
                if stack.is_empty() {
                    // Drop trailing junk after the object closes.
                    end = i + ch.len_utf8();
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() {
        text.truncate(end);
    }
    if in_string {
        text.push('"');
    }
    while let Some(closer) = stack.pop() {
        text.push(closer);
    }
    text
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.trim_start();
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        rest.trim().to_string()
    } else {
        trimmed.to_string()
    }
}

static TAGGED_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<function=([A-Za-z0-9_]+)>\s*(\{.*?\})\s*</function").unwrap()
});
static NAMED_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<function\s+name="([A-Za-z0-9_]+)">\s*(\{.*?\})\s*</function"#).unwrap()
});
static FENCED_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap());

/// Scan plain answer text for tool calls some models embed instead of using
/// the structured tool-call channel. Returns calls in order of appearance.
pub fn extract_embedded_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for caps in TAGGED_CALL.captures_iter(text).chain(NAMED_CALL.captures_iter(text)) {
        push_call(&mut calls, &caps[1], &caps[2]);
    }

    for caps in FENCED_CALL.captures_iter(text) {
        let Ok(value) = parse_tool_arguments(&caps[1]) else {
            continue;
        };
        let Some(name) = value.get("name").and_then(Value::as_str) else {
            continue;
        };
        let arguments = value
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        let name = name.to_string();
        let index = calls.len();
        calls.push(ToolCall::new(
            ToolCall::fallback_id(index),
            name,
            arguments.to_string(),
        ));
    }

    calls
}

fn push_call(calls: &mut Vec<ToolCall>, name: &str, raw_args: &str) {
    match parse_tool_arguments(raw_args) {
        Ok(args) => {
            let index = calls.len();
            calls.push(ToolCall::new(
                ToolCall::fallback_id(index),
                name,
                args.to_string(),
            ));
        }
        Err(e) => debug!("ignoring embedded call {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through_unchanged() {
        let raw = r#"{"path": "src/main.rs", "count": 3}"#;
        let parsed = parse_tool_arguments(raw).unwrap();
        assert_eq!(parsed, json!({"path": "src/main.rs", "count": 3}));
    }

    #[test]
    fn repair_is_idempotent_on_its_own_output() {
        let broken = r#"```json
{"cmd": "ls", "args": ["-l",]}
```"#;
        let first = parse_tool_arguments(broken).unwrap();
        let second = parse_tool_arguments(&first.to_string()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!({"cmd": "ls", "args": ["-l"]}));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let parsed = parse_tool_arguments(r#"{"a": 1, "b": 2,}"#).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn truncated_objects_are_closed() {
        let parsed = parse_tool_arguments(r#"{"path": "a.rs", "nested": {"x": [1, 2"#).unwrap();
        assert_eq!(parsed, json!({"path": "a.rs", "nested": {"x": [1, 2]}}));
    }

    #[test]
    fn unterminated_strings_are_closed() {
        let parsed = parse_tool_arguments(r#"{"path": "src/ma"#).unwrap();
        assert_eq!(parsed, json!({"path": "src/ma"}));
    }

    #[test]
    fn empty_arguments_become_an_empty_object() {
        assert_eq!(parse_tool_arguments("").unwrap(), json!({}));
        assert_eq!(parse_tool_arguments("  ").unwrap(), json!({}));
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let err = parse_tool_arguments("not json at all").unwrap_err();
        assert!(matches!(err, quill_common::Error::Protocol(_)));
    }

    #[test]
    fn extracts_tagged_function_calls() {
        let text = r#"Let me check. <function=read_file>{"path": "main.rs"}</function>"#;
        let calls = extract_embedded_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(
            serde_json::from_str::<Value>(&calls[0].arguments).unwrap(),
            json!({"path": "main.rs"})
        );
    }

    #[test]
    fn extracts_named_attribute_calls() {
        let text = r#"<function name="run_command">{"cmd": "cargo test"}</function>"#;
        let calls = extract_embedded_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "run_command");
    }

    #[test]
    fn extracts_fenced_json_calls() {
        let text = "Here's what I'll do:\n```json\n{\"name\": \"list_files_in_dir\", \"arguments\": {\"path\": \".\"}}\n```";
        let calls = extract_embedded_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_files_in_dir");
        assert_eq!(
            serde_json::from_str::<Value>(&calls[0].arguments).unwrap(),
            json!({"path": "."})
        );
    }

    #[test]
    fn fenced_json_without_a_name_is_not_a_call() {
        let text = "```json\n{\"path\": \".\"}\n```";
        assert!(extract_embedded_tool_calls(text).is_empty());
    }

    #[test]
    fn plain_text_yields_no_calls() {
        assert!(extract_embedded_tool_calls("Just an ordinary answer.").is_empty());
    }
}
