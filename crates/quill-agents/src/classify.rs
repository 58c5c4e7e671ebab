//! Substring classification of provider error text, shared by the key pool
//! and the adapters. Matching is case-insensitive; auth outranks quota,
//! quota outranks rate limiting, so a message mentioning both a 401 and a
//! rate limit disables the key instead of cooling it down.

use quill_common::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Quota,
    RateLimit,
}

const INVALID_KEY_PATTERNS: &[&str] = &[
    "invalid_api_key",
    "invalid api key",
    "authentication",
    "unauthorized",
    "401",
    "api key not found",
    "incorrect api key",
];

const CREDIT_EXHAUSTED_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "insufficient quota",
    "credit",
    "billing",
    "payment required",
    "402",
    "exceeded your current quota",
    "out of credits",
    "resource_exhausted",
    "quota failure",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate_limit",
    "rate limit",
    "too many requests",
    "429",
    "quota exceeded",
    "request limit",
    "ratelimit",
    "throttl",
];

const CONTEXT_OVERFLOW_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "maximum context",
    "context window",
    "prompt is too long",
    "request too large",
    "too many tokens",
];

pub fn classify(message: &str) -> Option<ErrorKind> {
    let lower = message.to_lowercase();
    if INVALID_KEY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorKind::Auth);
    }
    if CREDIT_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorKind::Quota);
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Some(ErrorKind::RateLimit);
    }
    None
}

pub fn is_context_overflow(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONTEXT_OVERFLOW_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Map raw provider error text into the typed taxonomy.
pub fn classified_error(provider: &str, message: &str) -> Error {
    if is_context_overflow(message) {
        return Error::ContextOverflow(message.to_string());
    }
    match classify(message) {
        Some(ErrorKind::Auth) => Error::Auth {
            provider: provider.to_string(),
            message: message.to_string(),
        },
        Some(ErrorKind::Quota) => Error::Quota {
            provider: provider.to_string(),
            message: message.to_string(),
        },
        Some(ErrorKind::RateLimit) => Error::RateLimit {
            provider: provider.to_string(),
            message: message.to_string(),
        },
        None => Error::Agent(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_outranks_quota_and_rate_limit() {
        let msg = "401 unauthorized: rate limit while checking billing";
        assert_eq!(classify(msg), Some(ErrorKind::Auth));
    }

    #[test]
    fn quota_outranks_rate_limit() {
        let msg = "insufficient_quota: too many requests";
        assert_eq!(classify(msg), Some(ErrorKind::Quota));
    }

    #[test]
    fn rate_limit_variants_match() {
        for msg in ["429 Too Many Requests", "Throttled", "ratelimit reached"] {
            assert_eq!(classify(msg), Some(ErrorKind::RateLimit), "{msg}");
        }
    }

    #[test]
    fn unknown_text_stays_unclassified() {
        assert_eq!(classify("model not found"), None);
        assert!(matches!(
            classified_error("groq", "model not found"),
            Error::Agent(_)
        ));
    }

    #[test]
    fn context_overflow_wins_over_rate_limit_wording() {
        let err = classified_error("openai", "maximum context length is 128000 tokens");
        assert!(matches!(err, Error::ContextOverflow(_)));
    }
}
