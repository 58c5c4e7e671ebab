use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Classified pipeline error. Variants carrying a provider name originate
/// from a specific backend; the rest are local to the pipeline.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("quota exhausted for {provider}: {message}")]
    Quota { provider: String, message: String },

    #[error("rate limited by {provider}: {message}")]
    RateLimit { provider: String, message: String },

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// Anything the classifier could not place. The original message is
    /// preserved verbatim for logging and user display.
    #[error("{0}")]
    Agent(String),
}

impl Error {
    /// Provider name, for errors tied to a backend.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Error::Auth { provider, .. }
            | Error::Quota { provider, .. }
            | Error::RateLimit { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Whether downgrading to a weaker model on the same provider is worth
    /// trying. Rate limits, quota exhaustion, and transient server failures
    /// qualify (a weaker model may have its own limits and pricing); auth
    /// problems affect every model on the provider equally.
    pub fn is_retryable_with_fallback(&self) -> bool {
        match self {
            Error::RateLimit { .. } | Error::Quota { .. } => true,
            Error::Agent(msg) => {
                let msg = msg.to_lowercase();
                ["500", "502", "503", "504", "overloaded", "timeout", "connection"]
                    .iter()
                    .any(|m| msg.contains(m))
            }
            _ => false,
        }
    }

    /// Whether the provider as a whole is out of service for this process
    /// (every key invalid or out of credit).
    pub fn is_provider_exhausted(&self) -> bool {
        matches!(self, Error::Auth { .. } | Error::Quota { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable_with_fallback() {
        let err = Error::RateLimit {
            provider: "groq".into(),
            message: "429 too many requests".into(),
        };
        assert!(err.is_retryable_with_fallback());
        assert!(!err.is_provider_exhausted());
        assert_eq!(err.provider(), Some("groq"));
    }

    #[test]
    fn auth_and_quota_exhaust_the_provider() {
        let auth = Error::Auth {
            provider: "openai".into(),
            message: "401".into(),
        };
        let quota = Error::Quota {
            provider: "openai".into(),
            message: "insufficient_quota".into(),
        };
        assert!(auth.is_provider_exhausted());
        assert!(quota.is_provider_exhausted());
        assert!(!auth.is_retryable_with_fallback());
        // Out of credit on one model is still worth a try on a cheaper one.
        assert!(quota.is_retryable_with_fallback());
    }

    #[test]
    fn transient_server_errors_are_retryable() {
        assert!(Error::Agent("upstream returned 503".into()).is_retryable_with_fallback());
        assert!(!Error::Agent("model not found".into()).is_retryable_with_fallback());
    }
}
