use std::sync::Arc;

/// Callbacks the UI layer can hook to surface pipeline state changes.
/// All methods default to no-ops so implementors pick what they care about.
pub trait PipelineNotifier: Send + Sync {
    fn key_rotated(&self, _provider: &str, _masked: &str) {}
    fn key_cooling_down(&self, _provider: &str, _masked: &str, _seconds: i64) {}
    fn key_disabled(&self, _provider: &str, _masked: &str, _reason: &str) {}
    fn model_fallback(&self, _provider: &str, _from: &str, _to: &str) {}
    fn model_restored(&self, _provider: &str, _model: &str) {}
    fn provider_switched(&self, _from: &str, _to: &str) {}
    fn context_compressed(&self, _turns_before: usize, _turns_after: usize) {}
}

pub struct NullNotifier;

impl PipelineNotifier for NullNotifier {}

pub fn null_notifier() -> Arc<dyn PipelineNotifier> {
    Arc::new(NullNotifier)
}
