use crate::utility::UtilityCompletion;
use quill_common::{ChatTurn, Role};
use quill_config::model;
use tracing::{debug, info, warn};

/// Crude but fast token estimate: roughly four characters per token. A real
/// tokenizer can replace [`estimate_turn_tokens`] without touching callers.
pub const CHARS_PER_TOKEN: usize = 4;

/// Per-message framing overhead, in tokens.
const ROLE_OVERHEAD_TOKENS: usize = 4;
/// Per-tool-call framing overhead, in tokens.
const TOOL_CALL_OVERHEAD_TOKENS: usize = 10;

/// Fraction of the context window that triggers compression.
pub const USAGE_THRESHOLD: f64 = 0.80;

const MIN_RECENT_TURNS: usize = 10;
const MAX_RECENT_TURNS: usize = 20;

/// Turns kept by the first emergency reduction.
pub const EMERGENCY_KEEP_FIRST: usize = 4;
/// Turns kept once a reduced request has bounced again.
pub const EMERGENCY_KEEP_RETRY: usize = 2;

const SUMMARY_MAX_TOKENS: u32 = 800;
const SUMMARY_TEMPERATURE: f64 = 0.3;

const SUMMARY_PROMPT: &str = "Summarize this conversation so it can be continued later. Cover: key topics discussed, decisions made, tasks completed or still in progress, and any user preferences that came up. Keep the summary under 500 words.\n\nConversation:\n";

const SUMMARY_ACK: &str =
    "I understand. I have the context from our previous conversation. Let's continue.";

pub fn estimate_turn_tokens(turn: &ChatTurn) -> usize {
    let mut tokens = turn.content.chars().count().div_ceil(CHARS_PER_TOKEN) + 1;
    tokens += ROLE_OVERHEAD_TOKENS;
    for call in &turn.tool_calls {
        tokens += TOOL_CALL_OVERHEAD_TOKENS;
        tokens += call.arguments.chars().count().div_ceil(CHARS_PER_TOKEN);
    }
    tokens
}

pub fn estimate_transcript_tokens(turns: &[ChatTurn]) -> usize {
    turns.iter().map(estimate_turn_tokens).sum()
}

/// How many recent turns survive compression, for a transcript of `len`
/// non-system turns.
fn retained_tail(len: usize) -> usize {
    MIN_RECENT_TURNS.max(MAX_RECENT_TURNS.min(len / 2))
}

/// Watches a conversation against one model's context window and rewrites
/// history when it gets close to the limit.
pub struct ContextBudgetManager {
    window: u32,
}

impl ContextBudgetManager {
    pub fn new(context_window: u32) -> Self {
        Self { window: context_window }
    }

    pub fn for_model(model_id: &str) -> Self {
        Self::new(model::context_window(model_id))
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn usage(&self, turns: &[ChatTurn]) -> f64 {
        estimate_transcript_tokens(turns) as f64 / self.window as f64
    }

    pub fn needs_compression(&self, turns: &[ChatTurn]) -> bool {
        self.usage(turns) >= USAGE_THRESHOLD
    }

    /// Compress history: older turns are replaced by a summary produced via
    /// the utility model, followed by the retained recent tail. On summarizer
    /// failure the older turns are simply dropped. The system turn always
    /// survives at slot 0, and the retained tail never begins with an
    /// orphaned tool result.
    pub async fn compress(
        &self,
        turns: Vec<ChatTurn>,
        summarizer: &dyn UtilityCompletion,
    ) -> Vec<ChatTurn> {
        let (system, body) = split_system(turns);
        let keep = retained_tail(body.len());
        if body.len() <= keep {
            return reassemble(system, Vec::new(), body);
        }

        let split = pairing_safe_split(&body, body.len() - keep);
        let (older, tail) = {
            let mut body = body;
            let tail = body.split_off(split);
            (body, tail)
        };
        if older.is_empty() {
            return reassemble(system, Vec::new(), tail);
        }

        let transcript = render_transcript(&older);
        let prompt = format!("{SUMMARY_PROMPT}{transcript}");
        match summarizer
            .complete(&prompt, SUMMARY_MAX_TOKENS, SUMMARY_TEMPERATURE)
            .await
        {
            Ok(summary) => {
                info!(
                    summarized = older.len(),
                    retained = tail.len(),
                    "compressed conversation history"
                );
                let bridge = vec![
                    ChatTurn::user(format!(
                        "[Previous conversation summary - {} messages]\n{}\n[End of summary - Recent messages follow]",
                        older.len(),
                        summary.trim()
                    )),
                    ChatTurn::assistant(SUMMARY_ACK),
                ];
                reassemble(system, bridge, tail)
            }
            Err(e) => {
                warn!("summarizer failed ({e}), truncating history instead");
                reassemble(system, Vec::new(), tail)
            }
        }
    }

    /// Last-resort reduction when a request already bounced off the context
    /// limit: keep the system turn plus the last `keep` turns. The caller
    /// tightens `keep` on each further rejection, since the provider, not
    /// the local estimate, decides what fits.
    pub fn emergency_reduce(&self, turns: Vec<ChatTurn>, keep: usize) -> Vec<ChatTurn> {
        let (system, body) = split_system(turns);
        let reduced = tail_slice(&body, keep);
        debug!(keep, "emergency reduction");
        reassemble(system, Vec::new(), reduced)
    }

    /// Terminal reduction once even the emergency tail is rejected: the
    /// system turn plus the current user message, nothing else.
    pub fn hard_reset(&self, turns: Vec<ChatTurn>) -> Vec<ChatTurn> {
        let (system, body) = split_system(turns);
        let last_user = body.into_iter().rev().find(|t| t.role == Role::User);
        warn!("hard reset to the current user message");
        let mut out = Vec::with_capacity(2);
        if let Some(system) = system {
            out.push(system);
        }
        out.extend(last_user);
        out
    }
}

fn split_system(mut turns: Vec<ChatTurn>) -> (Option<ChatTurn>, Vec<ChatTurn>) {
    if turns.first().is_some_and(|t| t.role == Role::System) {
        let system = turns.remove(0);
        (Some(system), turns)
    } else {
        (None, turns)
    }
}

/// Move a split point left until the turn that follows it is not a tool
/// result, so every retained tool turn keeps its paired assistant call.
fn pairing_safe_split(body: &[ChatTurn], mut split: usize) -> usize {
    while split > 0 && body.get(split).is_some_and(|t| t.role == Role::Tool) {
        split -= 1;
    }
    split
}

fn tail_slice(body: &[ChatTurn], count: usize) -> Vec<ChatTurn> {
    let start = body.len().saturating_sub(count);
    let start = pairing_safe_split(body, start);
    body[start..].to_vec()
}

fn reassemble(
    system: Option<ChatTurn>,
    bridge: Vec<ChatTurn>,
    tail: Vec<ChatTurn>,
) -> Vec<ChatTurn> {
    let mut out = Vec::with_capacity(1 + bridge.len() + tail.len());
    if let Some(system) = system {
        out.push(system);
    }
    out.extend(bridge);
    out.extend(tail);
    out
}

fn render_transcript(turns: &[ChatTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let role = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        out.push_str(role);
        out.push_str(": ");
        if turn.content.is_empty() && !turn.tool_calls.is_empty() {
            let names: Vec<&str> = turn.tool_calls.iter().map(|c| c.name.as_str()).collect();
            out.push_str(&format!("[called tools: {}]", names.join(", ")));
        } else {
            out.push_str(&turn.content);
        }
        out.push('\n');
    }
    out
}
