use async_trait::async_trait;
use quill_agents::providers::OpenAiCompatProvider;
use quill_agents::tools::{default_tool_definitions, ToolExecutor};
use quill_agents::utility::UtilityCompletion;
use quill_agents::{ConversationOrchestrator, KeyPool, ProviderSlot};
use quill_common::{ChatTurn, Result, Role};
use quill_config::{ProviderId, RotationMode};
use quill_db::SessionStore;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CannedExecutor;

#[async_trait]
impl ToolExecutor for CannedExecutor {
    async fn execute(&self, name: &str, arguments: &serde_json::Value) -> String {
        match name {
            "read_file" => format!("// contents of {}", arguments["path"].as_str().unwrap_or("?")),
            _ => "Error: unknown tool".to_string(),
        }
    }
}

struct NoopSummarizer;

#[async_trait]
impl UtilityCompletion for NoopSummarizer {
    async fn complete(&self, _prompt: &str, _max_tokens: u32, _temperature: f64) -> Result<String> {
        Ok("summary".to_string())
    }
}

fn sse_body(chunks: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// Full loop: the model asks for a tool, the result goes back, the final
/// answer streams in, and the transcript survives a database round trip.
#[tokio::test]
async fn tool_round_trip_persists_with_pairing_intact() {
    let server = MockServer::start().await;

    // Second request carries the tool result back: answer with text.
    let answer = sse_body(&[
        json!({"choices":[{"delta":{"content":"The file is empty."},"finish_reason":null}]}),
        json!({"choices":[{"delta":{},"finish_reason":"stop"}]}),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains(r#""role":"tool""#))
        .respond_with(ResponseTemplate::new(200).set_body_string(answer))
        .mount(&server)
        .await;

    // First request: the model asks to read a file.
    let tool_call = sse_body(&[
        json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"call_a","function":{"name":"read_file","arguments":"{\"path\":\"lib.rs\"}"}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(tool_call))
        .mount(&server)
        .await;

    let pool = Arc::new(KeyPool::from_keys(
        "groq",
        RotationMode::Sequential,
        ["gsk_test11112222"],
    ));
    let provider = OpenAiCompatProvider::groq(pool).with_base_url(server.uri());
    let orchestrator = ConversationOrchestrator::new(
        vec![ProviderSlot::new(ProviderId::Groq, Arc::new(provider))],
        Arc::new(CannedExecutor),
        Arc::new(NoopSummarizer),
    )
    .with_tools(default_tool_definitions());

    let mut turns = vec![
        ChatTurn::system("You are a coding assistant."),
        ChatTurn::user("what's in lib.rs?"),
    ];
    let answer = orchestrator
        .run_turn(&mut turns, "llama-3.3-70b-versatile", None)
        .await
        .unwrap();

    assert_eq!(answer, "The file is empty.");
    assert_eq!(turns.len(), 5);
    assert_eq!(turns[2].tool_calls[0].name, "read_file");
    assert_eq!(turns[3].role, Role::Tool);
    assert_eq!(turns[3].content, "// contents of lib.rs");
    assert!(quill_common::chat::tool_pairing_holds(&turns));

    let store = SessionStore::in_memory().unwrap();
    let conv = store.create_conversation(Some("lib.rs question")).unwrap();
    for turn in &turns {
        store.append_turn(&conv, turn).unwrap();
    }

    let loaded = store.load_turns(&conv).unwrap();
    assert_eq!(loaded.len(), turns.len());
    assert_eq!(loaded[2].tool_calls[0].id, "call_a");
    assert_eq!(loaded[3].tool_call_id.as_deref(), Some("call_a"));
    assert!(quill_common::chat::tool_pairing_holds(&loaded));
}
