use async_trait::async_trait;
use quill_common::Result;
use quill_config::TITLE_GENERATION_PROMPT;

const TITLE_MAX_TOKENS: u32 = 50;
const TITLE_TEMPERATURE: f64 = 0.7;
const TITLE_MAX_CHARS: usize = 50;

/// Small-model completion used for utility tasks: conversation titles and
/// context summaries. Implementations typically route to the configured
/// utility model on the cheapest available provider.
#[async_trait]
pub trait UtilityCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f64) -> Result<String>;
}

/// Generate a short conversation title from the user's first message.
pub async fn generate_title(
    client: &dyn UtilityCompletion,
    first_message: &str,
) -> Result<String> {
    let prompt = TITLE_GENERATION_PROMPT.replace("{message}", first_message);
    let raw = client
        .complete(&prompt, TITLE_MAX_TOKENS, TITLE_TEMPERATURE)
        .await?;

    let title = raw.trim().trim_matches(['"', '\'']).trim().to_string();
    if title.chars().count() > TITLE_MAX_CHARS {
        let head: String = title.chars().take(TITLE_MAX_CHARS - 3).collect();
        Ok(format!("{head}..."))
    } else {
        Ok(title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedClient(String);

    #[async_trait]
    impl UtilityCompletion for CannedClient {
        async fn complete(&self, _prompt: &str, _max_tokens: u32, _temperature: f64) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn titles_are_trimmed_and_unquoted() {
        let client = CannedClient("\"Fix Rust Borrow Error\"\n".into());
        let title = generate_title(&client, "help me fix this").await.unwrap();
        assert_eq!(title, "Fix Rust Borrow Error");
    }

    #[tokio::test]
    async fn long_titles_are_truncated_with_ellipsis() {
        let client = CannedClient("A".repeat(80));
        let title = generate_title(&client, "hi").await.unwrap();
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));
    }
}
