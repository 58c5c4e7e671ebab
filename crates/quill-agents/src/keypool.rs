use crate::classify::{self, ErrorKind};
use crate::notify::{null_notifier, PipelineNotifier};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use quill_common::{Error, Result};
use quill_config::RotationMode;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Rate-limited keys sit out for five minutes.
const RATE_LIMIT_COOLDOWN_SECS: i64 = 300;
/// Keys failing for unclassified reasons sit out for one minute.
const GENERIC_COOLDOWN_SECS: i64 = 60;
/// Consecutive unclassified failures before the cursor advances past a key.
const MAX_ERRORS_BEFORE_ROTATION: u32 = 3;

/// Substrings that mark a secret as a template value, not a real key.
const PLACEHOLDER_PATTERNS: &[&str] = &["your_", "example", "..."];

fn looks_like_placeholder(secret: &str) -> bool {
    let lower = secret.to_lowercase();
    lower.contains('<')
        || lower.contains('>')
        || PLACEHOLDER_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    RateLimited,
    /// Out of credit. Terminal for the process lifetime.
    Exhausted,
    /// Rejected by the provider. Terminal for the process lifetime.
    Invalid,
    CoolingDown,
}

#[derive(Debug, Clone)]
struct Credential {
    secret: String,
    status: KeyStatus,
    error_count: u32,
    last_error: Option<String>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl Credential {
    fn new(secret: String) -> Self {
        Self {
            secret,
            status: KeyStatus::Active,
            error_count: 0,
            last_error: None,
            cooldown_until: None,
        }
    }

    fn usable(&self) -> bool {
        self.status == KeyStatus::Active
    }
}

/// Display form of a secret: first and last four characters.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() < 8 {
        return "****".to_string();
    }
    format!("{}...{}", &secret[..4], &secret[secret.len() - 4..])
}

struct PoolState {
    creds: Vec<Credential>,
    cursor: usize,
}

/// Health-tracked pool of API keys for one provider.
pub struct KeyPool {
    provider: String,
    strategy: RotationMode,
    notifier: Arc<dyn PipelineNotifier>,
    state: Mutex<PoolState>,
}

impl KeyPool {
    pub fn new(provider: impl Into<String>, strategy: RotationMode) -> Self {
        Self {
            provider: provider.into(),
            strategy,
            notifier: null_notifier(),
            state: Mutex::new(PoolState {
                creds: Vec::new(),
                cursor: 0,
            }),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn PipelineNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Build a pool from configured keys, skipping rejects with a warning.
    pub fn from_keys<I, S>(provider: impl Into<String>, strategy: RotationMode, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool = Self::new(provider, strategy);
        for key in keys {
            if let Err(e) = pool.add_key(key.as_ref()) {
                warn!(provider = pool.provider, "skipping configured key: {e}");
            }
        }
        pool
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Add one key. Placeholder and empty secrets are rejected; duplicates
    /// are ignored.
    pub fn add_key(&self, secret: &str) -> Result<()> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(Error::Config(format!(
                "empty API key for {}",
                self.provider
            )));
        }
        if looks_like_placeholder(secret) {
            return Err(Error::Config(format!(
                "placeholder API key for {}: {}",
                self.provider,
                mask_secret(secret)
            )));
        }

        let mut state = self.lock();
        if state.creds.iter().any(|c| c.secret == secret) {
            return Ok(());
        }
        debug!(
            provider = self.provider,
            key = mask_secret(secret),
            "registered API key"
        );
        state.creds.push(Credential::new(secret.to_string()));
        Ok(())
    }

    /// The key the next request should use, or `None` when every key is
    /// disabled or cooling down.
    pub fn current_key(&self) -> Option<String> {
        let mut state = self.lock();
        self.revive_expired(&mut state);

        match self.strategy {
            RotationMode::Sequential => {
                let len = state.creds.len();
                for offset in 0..len {
                    let idx = (state.cursor + offset) % len.max(1);
                    if state.creds[idx].usable() {
                        state.cursor = idx;
                        return Some(state.creds[idx].secret.clone());
                    }
                }
                None
            }
            RotationMode::LoadBalancer => {
                let healthy: Vec<usize> = state
                    .creds
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.usable())
                    .map(|(i, _)| i)
                    .collect();
                if healthy.is_empty() {
                    return None;
                }
                let pick = healthy[rand::rng().random_range(0..healthy.len())];
                Some(state.creds[pick].secret.clone())
            }
        }
    }

    /// Record a failed request and classify it. The key's status changes
    /// according to the classification; sequential pools advance past keys
    /// that stopped being usable.
    pub fn report_error(&self, secret: &str, message: &str) -> Option<ErrorKind> {
        let kind = classify::classify(message);
        let mut state = self.lock();
        let Some(idx) = state.creds.iter().position(|c| c.secret == secret) else {
            return kind;
        };

        let masked = mask_secret(secret);
        {
            let cred = &mut state.creds[idx];
            cred.last_error = Some(message.to_string());
            match kind {
                Some(ErrorKind::Auth) => {
                    cred.status = KeyStatus::Invalid;
                    warn!(provider = self.provider, key = masked, "key rejected, disabling");
                    self.notifier.key_disabled(&self.provider, &masked, "invalid");
                }
                Some(ErrorKind::Quota) => {
                    cred.status = KeyStatus::Exhausted;
                    warn!(provider = self.provider, key = masked, "key out of credit, disabling");
                    self.notifier.key_disabled(&self.provider, &masked, "exhausted");
                }
                Some(ErrorKind::RateLimit) => {
                    cred.status = KeyStatus::RateLimited;
                    cred.cooldown_until =
                        Some(Utc::now() + Duration::seconds(RATE_LIMIT_COOLDOWN_SECS));
                    info!(
                        provider = self.provider,
                        key = masked,
                        "key rate limited, cooling down {RATE_LIMIT_COOLDOWN_SECS}s"
                    );
                    self.notifier
                        .key_cooling_down(&self.provider, &masked, RATE_LIMIT_COOLDOWN_SECS);
                }
                None => {
                    cred.error_count += 1;
                    cred.status = KeyStatus::CoolingDown;
                    cred.cooldown_until =
                        Some(Utc::now() + Duration::seconds(GENERIC_COOLDOWN_SECS));
                    info!(
                        provider = self.provider,
                        key = masked,
                        errors = cred.error_count,
                        "key failed, cooling down {GENERIC_COOLDOWN_SECS}s"
                    );
                    self.notifier
                        .key_cooling_down(&self.provider, &masked, GENERIC_COOLDOWN_SECS);
                }
            }
        }

        // Classified failures rotate immediately; unclassified ones only
        // after a streak, since the fault may not be the key's.
        let rotate = match kind {
            Some(_) => !state.creds[idx].usable(),
            None => state.creds[idx].error_count >= MAX_ERRORS_BEFORE_ROTATION,
        };
        if self.strategy == RotationMode::Sequential && rotate {
            self.advance(&mut state, idx);
        }
        kind
    }

    /// Record a successful request, restoring the key to full health.
    pub fn report_success(&self, secret: &str) {
        let mut state = self.lock();
        if let Some(cred) = state.creds.iter_mut().find(|c| c.secret == secret) {
            cred.error_count = 0;
            cred.last_error = None;
            if cred.status == KeyStatus::CoolingDown || cred.status == KeyStatus::RateLimited {
                cred.status = KeyStatus::Active;
                cred.cooldown_until = None;
            }
        }
    }

    /// Force the sequential cursor past the current key.
    pub fn rotate(&self) -> Option<String> {
        {
            let mut state = self.lock();
            self.revive_expired(&mut state);
            let cursor = state.cursor;
            self.advance(&mut state, cursor);
        }
        self.current_key()
    }

    pub fn healthy_count(&self) -> usize {
        let mut state = self.lock();
        self.revive_expired(&mut state);
        state.creds.iter().filter(|c| c.usable()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().creds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().creds.is_empty()
    }

    /// Masked key and status for each credential, for status displays.
    pub fn statuses(&self) -> Vec<(String, KeyStatus)> {
        let mut state = self.lock();
        self.revive_expired(&mut state);
        state
            .creds
            .iter()
            .map(|c| (mask_secret(&c.secret), c.status))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lazy revival: expired cooldowns flip back to `Active` on lookup.
    fn revive_expired(&self, state: &mut PoolState) {
        let now = Utc::now();
        for cred in &mut state.creds {
            if matches!(cred.status, KeyStatus::RateLimited | KeyStatus::CoolingDown)
                && cred.cooldown_until.is_some_and(|until| until <= now)
            {
                info!(
                    provider = self.provider,
                    key = mask_secret(&cred.secret),
                    "cooldown expired, key active again"
                );
                cred.status = KeyStatus::Active;
                cred.cooldown_until = None;
                // The error streak survives revival; only a successful
                // request clears it.
            }
        }
    }

    fn advance(&self, state: &mut PoolState, from: usize) {
        let len = state.creds.len();
        if len == 0 {
            return;
        }
        for offset in 1..=len {
            let idx = (from + offset) % len;
            if state.creds[idx].usable() {
                if idx != state.cursor {
                    state.cursor = idx;
                    self.notifier
                        .key_rotated(&self.provider, &mask_secret(&state.creds[idx].secret));
                }
                return;
            }
        }
    }

    #[cfg(test)]
    fn expire_cooldowns(&self) {
        let mut state = self.lock();
        for cred in &mut state.creds {
            if cred.cooldown_until.is_some() {
                cred.cooldown_until = Some(Utc::now() - Duration::seconds(1));
            }
        }
    }
}

/// Shared per-provider pools, handed out to adapters.
#[derive(Default)]
pub struct KeyPoolRegistry {
    pools: DashMap<String, Arc<KeyPool>>,
}

impl KeyPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pool: KeyPool) -> Arc<KeyPool> {
        let pool = Arc::new(pool);
        self.pools.insert(pool.provider().to_string(), pool.clone());
        pool
    }

    pub fn get(&self, provider: &str) -> Option<Arc<KeyPool>> {
        self.pools.get(provider).map(|entry| entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequential_pool(keys: &[&str]) -> KeyPool {
        KeyPool::from_keys("groq", RotationMode::Sequential, keys.iter().copied())
    }

    #[test]
    fn placeholder_and_empty_secrets_are_rejected() {
        let pool = KeyPool::new("groq", RotationMode::Sequential);
        assert!(pool.add_key("your_api_key_here").is_err());
        assert!(pool.add_key("sk-...").is_err());
        assert!(pool.add_key("   ").is_err());
        assert!(pool.add_key("gsk_realkey12345").is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn template_looking_secrets_are_rejected() {
        let pool = KeyPool::new("groq", RotationMode::Sequential);
        assert!(pool.add_key("your_groq_key_goes_here").is_err());
        assert!(pool.add_key("<paste-api-key-here>").is_err());
        assert!(pool.add_key("example_key_12345").is_err());
        assert!(pool.add_key("EXAMPLE_KEY_67890").is_err());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn duplicates_are_ignored() {
        let pool = sequential_pool(&["gsk_aaaa11112222", "gsk_aaaa11112222"]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn sequential_rotation_is_deterministic() {
        let pool = sequential_pool(&["key_one_111111", "key_two_222222", "key_three_3333"]);
        assert_eq!(pool.current_key().unwrap(), "key_one_111111");
        // Same key until something goes wrong.
        assert_eq!(pool.current_key().unwrap(), "key_one_111111");

        pool.report_error("key_one_111111", "429 too many requests");
        assert_eq!(pool.current_key().unwrap(), "key_two_222222");

        pool.report_error("key_two_222222", "401 unauthorized");
        assert_eq!(pool.current_key().unwrap(), "key_three_3333");
        assert_eq!(pool.healthy_count(), 1);
    }

    #[test]
    fn rate_limited_keys_revive_after_cooldown() {
        let pool = sequential_pool(&["key_one_111111"]);
        pool.report_error("key_one_111111", "rate limit reached");
        assert!(pool.current_key().is_none());

        pool.expire_cooldowns();
        assert_eq!(pool.current_key().unwrap(), "key_one_111111");
        assert_eq!(pool.healthy_count(), 1);
    }

    #[test]
    fn invalid_and_exhausted_keys_never_revive() {
        let pool = sequential_pool(&["key_one_111111", "key_two_222222"]);
        pool.report_error("key_one_111111", "invalid_api_key");
        pool.report_error("key_two_222222", "insufficient_quota");
        pool.expire_cooldowns();
        assert!(pool.current_key().is_none());
        assert_eq!(pool.healthy_count(), 0);
    }

    #[test]
    fn a_single_generic_error_sidelines_the_key() {
        let pool = sequential_pool(&["key_one_111111", "key_two_222222"]);
        pool.report_error("key_one_111111", "connection reset by peer");
        assert_eq!(pool.current_key().unwrap(), "key_two_222222");

        pool.expire_cooldowns();
        assert_eq!(pool.healthy_count(), 2);
    }

    #[test]
    fn generic_errors_rotate_only_after_three_in_a_row() {
        #[derive(Default)]
        struct CountingNotifier {
            rotations: Mutex<Vec<String>>,
        }
        impl PipelineNotifier for CountingNotifier {
            fn key_rotated(&self, _provider: &str, masked: &str) {
                self.rotations.lock().unwrap().push(masked.to_string());
            }
        }

        let notifier = Arc::new(CountingNotifier::default());
        let pool = KeyPool::new("groq", RotationMode::Sequential).with_notifier(notifier.clone());
        pool.add_key("key_one_111111").unwrap();
        pool.add_key("key_two_222222").unwrap();

        pool.report_error("key_one_111111", "connection reset by peer");
        pool.report_error("key_one_111111", "connection reset by peer");
        assert!(notifier.rotations.lock().unwrap().is_empty());

        pool.report_error("key_one_111111", "connection reset by peer");
        assert_eq!(notifier.rotations.lock().unwrap().len(), 1);
    }

    #[test]
    fn success_restores_a_cooling_key() {
        let pool = sequential_pool(&["key_one_111111"]);
        pool.report_error("key_one_111111", "timeout");
        assert!(pool.current_key().is_none());

        pool.report_success("key_one_111111");
        assert_eq!(pool.current_key().unwrap(), "key_one_111111");
        assert_eq!(pool.healthy_count(), 1);
    }

    #[test]
    fn load_balancer_only_picks_healthy_keys() {
        let pool = KeyPool::from_keys(
            "groq",
            RotationMode::LoadBalancer,
            ["key_one_111111", "key_two_222222"],
        );
        pool.report_error("key_one_111111", "401 unauthorized");
        for _ in 0..20 {
            assert_eq!(pool.current_key().unwrap(), "key_two_222222");
        }
    }

    #[test]
    fn masking_shows_first_and_last_four() {
        assert_eq!(mask_secret("gsk_abcdef123456"), "gsk_...3456");
        assert_eq!(mask_secret("short"), "****");
    }

    #[test]
    fn registry_hands_out_shared_pools() {
        let registry = KeyPoolRegistry::new();
        let pool = registry.insert(sequential_pool(&["key_one_111111"]));
        let same = registry.get("groq").unwrap();
        assert!(Arc::ptr_eq(&pool, &same));
        assert!(registry.get("anthropic").is_none());
    }
}
