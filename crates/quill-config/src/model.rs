use serde::{Deserialize, Serialize};

/// Backends the pipeline can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Groq,
    OpenRouter,
    Anthropic,
    OpenAi,
    Ollama,
    Google,
}

impl ProviderId {
    pub const ALL: [ProviderId; 6] = [
        ProviderId::Groq,
        ProviderId::OpenRouter,
        ProviderId::Anthropic,
        ProviderId::OpenAi,
        ProviderId::Ollama,
        ProviderId::Google,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Groq => "groq",
            ProviderId::OpenRouter => "openrouter",
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
            ProviderId::Ollama => "ollama",
            ProviderId::Google => "google",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }

    /// Environment variable holding the API key (or base URL for Ollama).
    pub fn env_key(&self) -> &'static str {
        match self {
            ProviderId::Groq => "GROQ_API_KEY",
            ProviderId::OpenRouter => "OPENROUTER_API_KEY",
            ProviderId::Anthropic => "ANTHROPIC_API_KEY",
            ProviderId::OpenAi => "OPENAI_API_KEY",
            ProviderId::Ollama => "OLLAMA_BASE_URL",
            ProviderId::Google => "GOOGLE_API_KEY",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderId::Ollama)
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderId::Groq => "https://api.groq.com/openai/v1",
            ProviderId::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderId::Anthropic => "https://api.anthropic.com",
            ProviderId::OpenAi => "https://api.openai.com/v1",
            ProviderId::Ollama => "http://localhost:11434",
            ProviderId::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the static model catalog.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Short alias users type (`"gpt-oss"`, `"claude-sonnet"`).
    pub alias: &'static str,
    /// Wire identifier sent to the provider.
    pub id: &'static str,
    pub name: &'static str,
    pub provider: ProviderId,
    pub context_window: u32,
    pub max_output_tokens: Option<u32>,
    pub supports_tools: bool,
}

pub const DEFAULT_MODEL: &str = "gpt-oss";

/// Small, fast model for utility tasks (title generation, summaries).
pub const UTILITY_MODEL: &str = "llama-3.1-8b-instant";

pub const TITLE_GENERATION_PROMPT: &str = "Generate a very short title (3-6 words max) for this conversation based on the user's first message.\nReply with ONLY the title, no quotes, no explanation, no punctuation at the end.\n\nUser's message: {message}\n\nTitle:";

const CATALOG: &[ModelSpec] = &[
    ModelSpec {
        alias: "llama",
        id: "llama-3.3-70b-versatile",
        name: "Llama 3.3 70B",
        provider: ProviderId::Groq,
        context_window: 128_000,
        max_output_tokens: None,
        supports_tools: true,
    },
    ModelSpec {
        alias: "gpt-oss",
        id: "openai/gpt-oss-120b",
        name: "GPT-OSS 120B",
        provider: ProviderId::Groq,
        context_window: 128_000,
        max_output_tokens: None,
        supports_tools: true,
    },
    ModelSpec {
        alias: "llama-mini",
        id: "llama-3.1-8b-instant",
        name: "Llama 3.1 8B Instant",
        provider: ProviderId::Groq,
        context_window: 128_000,
        max_output_tokens: None,
        supports_tools: true,
    },
    ModelSpec {
        alias: "claude-opus",
        id: "claude-opus-4-20250514",
        name: "Claude Opus 4",
        provider: ProviderId::Anthropic,
        context_window: 200_000,
        max_output_tokens: Some(32_000),
        supports_tools: true,
    },
    ModelSpec {
        alias: "claude-sonnet",
        id: "claude-sonnet-4-20250514",
        name: "Claude Sonnet 4",
        provider: ProviderId::Anthropic,
        context_window: 200_000,
        max_output_tokens: Some(16_000),
        supports_tools: true,
    },
    ModelSpec {
        alias: "claude-haiku",
        id: "claude-3-5-haiku-20241022",
        name: "Claude 3.5 Haiku",
        provider: ProviderId::Anthropic,
        context_window: 200_000,
        max_output_tokens: Some(8_192),
        supports_tools: true,
    },
    ModelSpec {
        alias: "gpt-4o",
        id: "gpt-4o",
        name: "GPT-4o",
        provider: ProviderId::OpenAi,
        context_window: 128_000,
        max_output_tokens: Some(16_384),
        supports_tools: true,
    },
    ModelSpec {
        alias: "gpt-4o-mini",
        id: "gpt-4o-mini",
        name: "GPT-4o Mini",
        provider: ProviderId::OpenAi,
        context_window: 128_000,
        max_output_tokens: Some(16_384),
        supports_tools: true,
    },
    ModelSpec {
        alias: "o1",
        id: "o1",
        name: "OpenAI o1",
        provider: ProviderId::OpenAi,
        context_window: 200_000,
        max_output_tokens: Some(100_000),
        supports_tools: false,
    },
    ModelSpec {
        alias: "gemini-pro",
        id: "gemini-1.5-pro",
        name: "Gemini 1.5 Pro",
        provider: ProviderId::Google,
        context_window: 2_000_000,
        max_output_tokens: Some(8_192),
        supports_tools: true,
    },
    ModelSpec {
        alias: "gemini-flash",
        id: "gemini-2.0-flash",
        name: "Gemini 2.0 Flash",
        provider: ProviderId::Google,
        context_window: 1_000_000,
        max_output_tokens: Some(8_192),
        supports_tools: true,
    },
    ModelSpec {
        alias: "gemini-flash-lite",
        id: "gemini-2.0-flash-lite",
        name: "Gemini 2.0 Flash Lite",
        provider: ProviderId::Google,
        context_window: 1_000_000,
        max_output_tokens: Some(8_192),
        supports_tools: true,
    },
    ModelSpec {
        alias: "ollama-llama3",
        id: "llama3.2",
        name: "Llama 3.2 (Ollama)",
        provider: ProviderId::Ollama,
        context_window: 128_000,
        max_output_tokens: None,
        supports_tools: true,
    },
    ModelSpec {
        alias: "ollama-qwen",
        id: "qwen2.5-coder",
        name: "Qwen 2.5 Coder (Ollama)",
        provider: ProviderId::Ollama,
        context_window: 128_000,
        max_output_tokens: None,
        supports_tools: true,
    },
];

pub fn catalog() -> &'static [ModelSpec] {
    CATALOG
}

/// Look up by alias first, then by wire id.
pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    CATALOG
        .iter()
        .find(|m| m.alias == name)
        .or_else(|| CATALOG.iter().find(|m| m.id == name))
}

pub fn context_window(model_id: &str) -> u32 {
    find_model(model_id).map(|m| m.context_window).unwrap_or(128_000)
}

/// Strongest-to-weakest downgrade order per provider. Models absent from a
/// chain never participate in fallback.
pub fn fallback_chain(provider: ProviderId) -> &'static [&'static str] {
    match provider {
        ProviderId::Groq => &[
            "openai/gpt-oss-120b",
            "llama-3.3-70b-versatile",
            "llama-3.1-8b-instant",
        ],
        ProviderId::Anthropic => &[
            "claude-opus-4-20250514",
            "claude-sonnet-4-20250514",
            "claude-3-5-haiku-20241022",
        ],
        ProviderId::OpenAi => &["gpt-4o", "gpt-4o-mini"],
        ProviderId::Google => &[
            "gemini-1.5-pro",
            "gemini-2.0-flash",
            "gemini-2.0-flash-lite",
        ],
        ProviderId::OpenRouter | ProviderId::Ollama => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_model_resolves_alias_and_wire_id() {
        assert_eq!(find_model("gpt-oss").unwrap().id, "openai/gpt-oss-120b");
        assert_eq!(
            find_model("openai/gpt-oss-120b").unwrap().alias,
            "gpt-oss"
        );
        assert!(find_model("nope").is_none());
    }

    #[test]
    fn context_window_defaults_for_unknown_models() {
        assert_eq!(context_window("gemini-1.5-pro"), 2_000_000);
        assert_eq!(context_window("some-new-model"), 128_000);
    }

    #[test]
    fn fallback_chains_stay_within_their_provider() {
        for provider in ProviderId::ALL {
            for id in fallback_chain(provider) {
                let spec = find_model(id).unwrap();
                assert_eq!(spec.provider, provider);
            }
        }
    }

    #[test]
    fn default_model_is_in_the_catalog() {
        assert!(find_model(DEFAULT_MODEL).is_some());
    }
}
