use crate::notify::{null_notifier, PipelineNotifier};
use chrono::{DateTime, Duration, Utc};
use quill_config::{model, ProviderId};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// How long a downgrade stays active before the original model is retried.
const FALLBACK_LEASE_SECS: i64 = 600;

/// Maximum downgrade hops within one recovery episode.
pub const MAX_FALLBACK_HOPS: usize = 2;

#[derive(Debug, Clone)]
pub struct FallbackState {
    pub original_model: String,
    pub active_model: String,
    pub since: DateTime<Utc>,
}

impl FallbackState {
    fn expired(&self) -> bool {
        Utc::now() - self.since >= Duration::seconds(FALLBACK_LEASE_SECS)
    }
}

/// Single-slot, time-boxed model downgrade for one provider. At most one
/// fallback is active at a time; the lease expiring restores the original
/// model lazily on the next lookup.
pub struct ModelFallbackChain {
    provider: ProviderId,
    notifier: Arc<dyn PipelineNotifier>,
    state: Mutex<Option<FallbackState>>,
}

impl ModelFallbackChain {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            notifier: null_notifier(),
            state: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn PipelineNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Model to actually send: the active downgrade while its lease holds,
    /// otherwise the requested model.
    pub fn effective_model(&self, requested: &str) -> String {
        let mut state = self.lock();
        match state.as_ref() {
            Some(fb) if fb.expired() => {
                info!(
                    provider = self.provider.as_str(),
                    model = fb.original_model,
                    "fallback lease expired, restoring original model"
                );
                self.notifier
                    .model_restored(self.provider.as_str(), &fb.original_model);
                *state = None;
                requested.to_string()
            }
            Some(fb) if fb.original_model == requested => fb.active_model.clone(),
            _ => requested.to_string(),
        }
    }

    /// Step to the next weaker model in this provider's chain. A model not
    /// in the chain steps onto its head; `None` only when the current model
    /// is already the weakest or the provider declares no chain.
    pub fn downgrade(&self, current: &str) -> Option<String> {
        let chain = model::fallback_chain(self.provider);
        let next = match chain.iter().position(|m| *m == current) {
            Some(pos) => chain.get(pos + 1)?.to_string(),
            None => chain.first()?.to_string(),
        };

        let mut state = self.lock();
        let original = match state.take() {
            // Keep the first original across multi-hop episodes.
            Some(fb) if fb.active_model == current => fb.original_model,
            _ => current.to_string(),
        };
        warn!(
            provider = self.provider.as_str(),
            from = current,
            to = next,
            "falling back to weaker model"
        );
        self.notifier
            .model_fallback(self.provider.as_str(), current, &next);
        *state = Some(FallbackState {
            original_model: original,
            active_model: next.clone(),
            since: Utc::now(),
        });
        Some(next)
    }

    /// Clear any active downgrade immediately.
    pub fn restore(&self) {
        let mut state = self.lock();
        if let Some(fb) = state.take() {
            info!(
                provider = self.provider.as_str(),
                model = fb.original_model,
                "restoring original model"
            );
            self.notifier
                .model_restored(self.provider.as_str(), &fb.original_model);
        }
    }

    pub fn active_fallback(&self) -> Option<FallbackState> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<FallbackState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn backdate(&self, secs: i64) {
        if let Some(fb) = self.lock().as_mut() {
            fb.since = Utc::now() - Duration::seconds(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_walks_the_chain_strongest_to_weakest() {
        let chain = ModelFallbackChain::new(ProviderId::Anthropic);
        let first = chain.downgrade("claude-opus-4-20250514").unwrap();
        assert_eq!(first, "claude-sonnet-4-20250514");
        let second = chain.downgrade(&first).unwrap();
        assert_eq!(second, "claude-3-5-haiku-20241022");
        assert!(chain.downgrade(&second).is_none());
    }

    #[test]
    fn single_slot_keeps_the_first_original() {
        let chain = ModelFallbackChain::new(ProviderId::Anthropic);
        chain.downgrade("claude-opus-4-20250514").unwrap();
        chain.downgrade("claude-sonnet-4-20250514").unwrap();
        let state = chain.active_fallback().unwrap();
        assert_eq!(state.original_model, "claude-opus-4-20250514");
        assert_eq!(state.active_model, "claude-3-5-haiku-20241022");
    }

    #[test]
    fn effective_model_maps_only_the_original() {
        let chain = ModelFallbackChain::new(ProviderId::Groq);
        chain.downgrade("openai/gpt-oss-120b").unwrap();
        assert_eq!(
            chain.effective_model("openai/gpt-oss-120b"),
            "llama-3.3-70b-versatile"
        );
        // Other models pass through untouched.
        assert_eq!(
            chain.effective_model("llama-3.1-8b-instant"),
            "llama-3.1-8b-instant"
        );
    }

    #[test]
    fn lease_expiry_restores_the_original() {
        let chain = ModelFallbackChain::new(ProviderId::Groq);
        chain.downgrade("openai/gpt-oss-120b").unwrap();
        chain.backdate(FALLBACK_LEASE_SECS + 1);
        assert_eq!(
            chain.effective_model("openai/gpt-oss-120b"),
            "openai/gpt-oss-120b"
        );
        assert!(chain.active_fallback().is_none());
    }

    #[test]
    fn unknown_models_step_onto_the_chain_head() {
        let chain = ModelFallbackChain::new(ProviderId::Groq);
        assert_eq!(
            chain.downgrade("some-custom-model").unwrap(),
            "openai/gpt-oss-120b"
        );
        let state = chain.active_fallback().unwrap();
        assert_eq!(state.original_model, "some-custom-model");
        assert_eq!(state.active_model, "openai/gpt-oss-120b");
    }

    #[test]
    fn providers_without_a_chain_never_downgrade() {
        let chain = ModelFallbackChain::new(ProviderId::Ollama);
        assert!(chain.downgrade("qwen2.5-coder").is_none());
        assert!(chain.active_fallback().is_none());
    }

    #[test]
    fn restore_clears_the_slot() {
        let chain = ModelFallbackChain::new(ProviderId::OpenAi);
        chain.downgrade("gpt-4o").unwrap();
        chain.restore();
        assert_eq!(chain.effective_model("gpt-4o"), "gpt-4o");
    }
}
