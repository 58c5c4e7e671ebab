use crate::args::{extract_embedded_tool_calls, parse_tool_arguments};
use crate::context::{ContextBudgetManager, EMERGENCY_KEEP_FIRST, EMERGENCY_KEEP_RETRY};
use crate::fallback::{ModelFallbackChain, MAX_FALLBACK_HOPS};
use crate::notify::{null_notifier, PipelineNotifier};
use crate::providers::{ChatProvider, ChatRequest, StreamEvent, ToolCallAccumulator};
use crate::tools::{annotate_result, ToolExecutor};
use crate::utility::UtilityCompletion;
use futures::StreamExt;
use quill_common::{ChatTurn, Error, Result, ToolCall, ToolDefinition};
use quill_config::{model, ProviderId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Tool execution rounds allowed within one user turn.
pub const MAX_TOOL_ROUNDS: usize = 3;

/// Upper bound on concurrently running tool calls.
pub const MAX_CONCURRENT_TOOLS: usize = 5;

/// Emergency reductions tried before the hard reset.
pub const MAX_REDUCTION_ATTEMPTS: usize = 3;

/// One configured backend: the adapter plus its per-provider fallback chain.
pub struct ProviderSlot {
    pub id: ProviderId,
    pub provider: Arc<dyn ChatProvider>,
    pub chain: Arc<ModelFallbackChain>,
}

impl ProviderSlot {
    pub fn new(id: ProviderId, provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            id,
            provider,
            chain: Arc::new(ModelFallbackChain::new(id)),
        }
    }

    pub fn with_chain(mut self, chain: Arc<ModelFallbackChain>) -> Self {
        self.chain = chain;
        self
    }
}

/// What the ladder does next after a failed request. Recovery is an
/// explicit bounded loop over these decisions; key rotation never appears
/// here because the adapters handle it internally.
#[derive(Debug)]
enum RecoveryDecision {
    /// Context overflow: shrink the transcript to the last `keep` turns.
    RetryAfterReduction { keep: usize },
    /// Overflow persists after reductions: cut down to the system turn and
    /// the current user message, and retry one last time.
    RetryAfterHardReset,
    /// Downgrade to a weaker model on the same provider.
    FallbackModel { model: String },
    /// Move to an untried provider, resetting the per-provider budgets.
    SwitchProvider { slot: usize, model: String },
    /// Nothing left to try.
    Fail(Error),
}

struct LadderState {
    slot: usize,
    model: String,
    fallback_hops: usize,
    reductions: usize,
    hard_reset: bool,
    tried: HashSet<usize>,
}

struct StreamOutcome {
    content: String,
    tool_calls: Vec<ToolCall>,
}

/// Drives one conversation against the configured providers: streaming,
/// tool execution, context compression, and the recovery ladder.
pub struct ConversationOrchestrator {
    slots: Vec<ProviderSlot>,
    executor: Arc<dyn ToolExecutor>,
    summarizer: Arc<dyn UtilityCompletion>,
    tools: Vec<ToolDefinition>,
    notifier: Arc<dyn PipelineNotifier>,
}

impl ConversationOrchestrator {
    pub fn new(
        slots: Vec<ProviderSlot>,
        executor: Arc<dyn ToolExecutor>,
        summarizer: Arc<dyn UtilityCompletion>,
    ) -> Self {
        Self {
            slots,
            executor,
            summarizer,
            tools: Vec::new(),
            notifier: null_notifier(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn PipelineNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Run one user turn to completion. The transcript already contains the
    /// user's message; on success it gains the assistant turn plus any tool
    /// turns produced along the way, and the final answer text is returned.
    /// Streaming deltas are forwarded to `events` as they arrive.
    pub async fn run_turn(
        &self,
        turns: &mut Vec<ChatTurn>,
        requested_model: &str,
        events: Option<mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<String> {
        if self.slots.is_empty() {
            return Err(Error::Config("no providers configured".into()));
        }

        let manager = ContextBudgetManager::for_model(requested_model);
        if manager.needs_compression(turns) {
            let before = turns.len();
            *turns = manager
                .compress(std::mem::take(turns), self.summarizer.as_ref())
                .await;
            info!(before, after = turns.len(), "compressed context before send");
            self.notifier.context_compressed(before, turns.len());
        }

        let start_slot = self.slot_for_model(requested_model);
        let mut st = LadderState {
            slot: start_slot,
            model: requested_model.to_string(),
            fallback_hops: 0,
            reductions: 0,
            hard_reset: false,
            tried: HashSet::from([start_slot]),
        };

        let mut rounds = 0usize;
        loop {
            let slot = &self.slots[st.slot];
            let model = slot.chain.effective_model(&st.model);
            let request = ChatRequest {
                model,
                turns: turns.clone(),
                tools: self.tools.clone(),
                max_tokens: None,
                temperature: None,
            };

            match self.stream_once(slot.provider.as_ref(), &request, events.as_ref()).await {
                Ok(outcome) => {
                    let mut calls = outcome.tool_calls;
                    if calls.is_empty() {
                        calls = extract_embedded_tool_calls(&outcome.content);
                        if !calls.is_empty() {
                            debug!(count = calls.len(), "extracted tool calls from answer text");
                        }
                    }

                    if calls.is_empty() {
                        turns.push(ChatTurn::assistant(outcome.content.clone()));
                        return Ok(outcome.content);
                    }
                    if rounds >= MAX_TOOL_ROUNDS {
                        warn!(rounds, "tool round limit reached, stopping tool execution");
                        turns.push(ChatTurn::assistant(outcome.content.clone()));
                        return Ok(outcome.content);
                    }
                    rounds += 1;

                    turns.push(ChatTurn::assistant_with_tools(
                        outcome.content,
                        calls.clone(),
                    ));
                    let results = self.execute_tools(&calls).await;
                    for (call, output) in calls.iter().zip(results) {
                        turns.push(ChatTurn::tool(&call.id, annotate_result(&output)));
                    }
                }
                Err(err) => self.recover(err, &mut st, &manager, turns).await?,
            }
        }
    }

    /// Apply one rung of the recovery ladder, mutating the ladder state (and
    /// the transcript, for emergency reduction). Returns an error only when
    /// the ladder is exhausted.
    async fn recover(
        &self,
        err: Error,
        st: &mut LadderState,
        manager: &ContextBudgetManager,
        turns: &mut Vec<ChatTurn>,
    ) -> Result<()> {
        let original = err.clone();
        let mut decision = self.decide(err, st);
        loop {
            match decision {
                RecoveryDecision::RetryAfterReduction { keep } => {
                    warn!(keep, "context overflow, applying emergency reduction");
                    *turns = manager.emergency_reduce(std::mem::take(turns), keep);
                    return Ok(());
                }
                RecoveryDecision::RetryAfterHardReset => {
                    warn!("context overflow persists, hard resetting the transcript");
                    *turns = manager.hard_reset(std::mem::take(turns));
                    return Ok(());
                }
                RecoveryDecision::FallbackModel { model } => {
                    st.model = model;
                    return Ok(());
                }
                RecoveryDecision::SwitchProvider { slot, model } => {
                    if self.slots[slot].provider.is_available().await {
                        let from = self.slots[st.slot].provider.provider_id().to_string();
                        let to = self.slots[slot].provider.provider_id().to_string();
                        info!(from, to, "switching provider");
                        self.notifier.provider_switched(&from, &to);
                        st.slot = slot;
                        st.model = model;
                        st.fallback_hops = 0;
                        st.reductions = 0;
                        st.hard_reset = false;
                        return Ok(());
                    }
                    debug!(
                        provider = self.slots[slot].provider.provider_id(),
                        "provider unavailable, skipping"
                    );
                    decision = match self.next_untried_slot(st) {
                        Some((slot, model)) => RecoveryDecision::SwitchProvider { slot, model },
                        None => RecoveryDecision::Fail(original.clone()),
                    };
                }
                RecoveryDecision::Fail(err) => return Err(err),
            }
        }
    }

    fn decide(&self, err: Error, st: &mut LadderState) -> RecoveryDecision {
        if matches!(err, Error::ContextOverflow(_)) {
            if st.reductions < MAX_REDUCTION_ATTEMPTS {
                st.reductions += 1;
                let keep = if st.reductions == 1 {
                    EMERGENCY_KEEP_FIRST
                } else {
                    EMERGENCY_KEEP_RETRY
                };
                return RecoveryDecision::RetryAfterReduction { keep };
            }
            if !st.hard_reset {
                st.hard_reset = true;
                return RecoveryDecision::RetryAfterHardReset;
            }
        }

        if err.is_retryable_with_fallback() && st.fallback_hops < MAX_FALLBACK_HOPS {
            let chain = &self.slots[st.slot].chain;
            let current = chain.effective_model(&st.model);
            if let Some(next) = chain.downgrade(&current) {
                st.fallback_hops += 1;
                return RecoveryDecision::FallbackModel { model: next };
            }
        }

        match self.next_untried_slot(st) {
            Some((slot, model)) => RecoveryDecision::SwitchProvider { slot, model },
            None => RecoveryDecision::Fail(err),
        }
    }

    fn next_untried_slot(&self, st: &mut LadderState) -> Option<(usize, String)> {
        let idx = (0..self.slots.len()).find(|idx| !st.tried.contains(idx))?;
        st.tried.insert(idx);
        Some((idx, self.entry_model(idx, &st.model)))
    }

    /// Model to start with after switching to `slot`: the requested model if
    /// it belongs there, otherwise the strongest model in that provider's
    /// chain.
    fn entry_model(&self, slot: usize, requested: &str) -> String {
        let id = self.slots[slot].id;
        if model::find_model(requested).map(|s| s.provider) == Some(id) {
            return requested.to_string();
        }
        model::fallback_chain(id)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| requested.to_string())
    }

    fn slot_for_model(&self, requested: &str) -> usize {
        model::find_model(requested)
            .and_then(|spec| self.slots.iter().position(|s| s.id == spec.provider))
            .unwrap_or(0)
    }

    async fn stream_once(
        &self,
        provider: &dyn ChatProvider,
        request: &ChatRequest,
        events: Option<&mpsc::UnboundedSender<StreamEvent>>,
    ) -> Result<StreamOutcome> {
        let mut stream = provider.stream_chat(request).await?;
        let mut accumulator = ToolCallAccumulator::new();
        let mut content = String::new();

        while let Some(event) = stream.next().await {
            let event = event?;
            if let Some(tx) = events {
                let _ = tx.send(event.clone());
            }
            match event {
                StreamEvent::ContentDelta { text } => content.push_str(&text),
                StreamEvent::ReasoningDelta { .. } => {}
                StreamEvent::ToolCallDelta { index, id, name, arguments } => {
                    accumulator.apply(index, id.as_deref(), name.as_deref(), arguments.as_deref());
                }
                StreamEvent::ExecutedToolResult { name, output } => {
                    content.push_str(&format!("\n[{name}]\n{output}\n"));
                }
                StreamEvent::FinishReason { .. } => {}
            }
        }

        Ok(StreamOutcome {
            content,
            tool_calls: accumulator.into_calls(),
        })
    }

    /// Execute one round of tool calls, at most [`MAX_CONCURRENT_TOOLS`] at
    /// a time, returning outputs in the original call order. Dropping the
    /// future aborts any still-running tasks.
    async fn execute_tools(&self, calls: &[ToolCall]) -> Vec<String> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_TOOLS));
        let mut set = JoinSet::new();

        for (index, call) in calls.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, "Error: tool pool shut down".to_string()),
                };
                let output = match parse_tool_arguments(&call.arguments) {
                    Ok(arguments) => executor.execute(&call.name, &arguments).await,
                    Err(e) => format!("Error: {e}"),
                };
                (index, output)
            });
        }

        let mut results: Vec<Option<String>> = vec![None; calls.len()];
        while let Some(joined) = set.join_next().await {
            if let Ok((index, output)) = joined {
                results[index] = Some(output);
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| "Error: tool task failed".to_string()))
            .collect()
    }
}
