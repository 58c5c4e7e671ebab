use async_trait::async_trait;
use quill_common::ToolDefinition;
use serde_json::{json, Value};

/// Executes tool calls on behalf of the orchestrator. Implementations never
/// return errors: a failed tool produces descriptive output text, which is
/// fed back to the model rather than aborting the turn.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &Value) -> String;
}

/// Output markers that indicate a tool invocation went wrong.
const FAILURE_MARKERS: &[&str] = &[
    "[exit code:",
    "not recognized",
    "command not found",
    "no se reconoce",
];

pub fn looks_like_failure(output: &str) -> bool {
    output.starts_with("Error") || FAILURE_MARKERS.iter().any(|m| output.contains(m))
}

/// Wrap failed tool output so the model treats it as something to analyze
/// rather than an answer.
pub fn annotate_result(output: &str) -> String {
    if looks_like_failure(output) {
        format!(
            "[COMMAND FAILED]\n{output}\n\nPlease analyze this error and try an alternative approach."
        )
    } else {
        output.to_string()
    }
}

/// The assistant's built-in tool set. Some hosted models (Groq's gpt-oss
/// family) require a tool list on every request, so this also serves as the
/// injected default.
pub fn default_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "list_files_in_dir".into(),
            description: "List files and folders in a directory".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path, defaults to the working directory"}
                }
            }),
        },
        ToolDefinition {
            name: "read_file".into(),
            description: "Read the content of a file".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path of the file to read"}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "create_folder".into(),
            description: "Create a new directory".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path of the directory to create"}
                },
                "required": ["path"]
            }),
        },
        ToolDefinition {
            name: "create_file".into(),
            description: "Create or overwrite a file with the given content".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path of the file to write"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolDefinition {
            name: "run_command".into(),
            description: "Execute a system command and return its output".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command line to execute"}
                },
                "required": ["command"]
            }),
        },
    ]
}
