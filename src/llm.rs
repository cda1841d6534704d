//! Text-completion and token-counting capabilities.
//!
//! Every LLM call in the retrieval/assembly pipeline goes through
//! [`CompletionClient`], and every token cost through [`TokenCounter`], so
//! tests can substitute deterministic implementations. The OpenAI-backed
//! client applies the same retry/backoff discipline as the embedding client.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::embedding::strip_provider;

/// OpenAI-style chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A fallible text-completion capability.
///
/// Callers must not assume success: every call site in the pipeline has a
/// documented fallback, except none — failures here are absorbed locally.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String>;
}

/// Count the approximate token cost of `text` for `model`.
///
/// Approximate is acceptable; implementations must be monotonic with text
/// length so budget accounting stays correct.
pub trait TokenCounter: Send + Sync {
    fn count(&self, model: &str, text: &str) -> usize;
}

/// Character-ratio token counter.
///
/// The ratio is an explicit constructor parameter rather than a constant
/// buried at the call site; 4 chars per token is the usual approximation for
/// English prose.
pub struct HeuristicCounter {
    chars_per_token: usize,
}

impl HeuristicCounter {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, _model: &str, text: &str) -> usize {
        (text.chars().count() / self.chars_per_token).max(1)
    }
}

// ============ API key validation ============

/// Provider → required environment variable. `None` means no key is needed
/// (local providers).
const PROVIDER_ENV: &[(&str, Option<&str>)] = &[
    ("openai", Some("OPENAI_API_KEY")),
    ("anthropic", Some("ANTHROPIC_API_KEY")),
    ("azure", Some("AZURE_API_KEY")),
    ("cohere", Some("COHERE_API_KEY")),
    ("google", Some("GOOGLE_API_KEY")),
    ("mistral", Some("MISTRAL_API_KEY")),
    ("groq", Some("GROQ_API_KEY")),
    ("ollama", None),
];

/// Check that the API key env var required by `model`'s provider is set.
///
/// Run before any generation begins so a missing key fails up front rather
/// than mid-pipeline. Unknown providers default to requiring nothing.
pub fn validate_api_key(model: &str) -> Result<()> {
    let provider = match model.split_once('/') {
        Some((p, _)) => p.to_lowercase(),
        None => "openai".to_string(),
    };

    let env_var = PROVIDER_ENV
        .iter()
        .find(|(name, _)| *name == provider)
        .and_then(|(_, var)| *var);

    if let Some(var) = env_var {
        if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
            bail!(
                "API key not found for provider '{}'. Set the {} environment variable.",
                provider,
                var
            );
        }
    }

    Ok(())
}

/// Context window size in tokens for `model`; 8192 when unknown.
pub fn context_window(model: &str) -> usize {
    const WINDOWS: &[(&str, usize)] = &[
        ("openai/gpt-4o", 128_000),
        ("openai/gpt-4o-mini", 128_000),
        ("openai/gpt-4-turbo", 128_000),
        ("openai/gpt-3.5-turbo", 16_384),
        ("anthropic/claude-3-5-sonnet-20241022", 200_000),
        ("anthropic/claude-3-5-haiku-20241022", 200_000),
    ];
    WINDOWS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, w)| *w)
        .unwrap_or(8_192)
}

// ============ OpenAI completion client ============

/// Completion client backed by the OpenAI chat completions API.
///
/// Retry strategy matches the embedding client: 429/5xx/network errors are
/// retried with exponential backoff, other 4xx fail immediately.
pub struct OpenAiCompletion {
    client: reqwest::Client,
    max_retries: u32,
}

impl OpenAiCompletion {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletion {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let body = serde_json::json!({
            "model": strip_provider(model),
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Completion API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Completion API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing choices[0].message.content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counter_ratio() {
        let counter = HeuristicCounter::new(4);
        assert_eq!(counter.count("any", &"x".repeat(400)), 100);
    }

    #[test]
    fn test_heuristic_counter_minimum_one() {
        let counter = HeuristicCounter::new(4);
        assert_eq!(counter.count("any", ""), 1);
        assert_eq!(counter.count("any", "ab"), 1);
    }

    #[test]
    fn test_heuristic_counter_monotonic() {
        let counter = HeuristicCounter::default();
        let mut prev = 0;
        for len in [0, 10, 100, 1000, 10_000] {
            let n = counter.count("any", &"a".repeat(len));
            assert!(n >= prev, "count must not decrease with length");
            prev = n;
        }
    }

    #[test]
    fn test_validate_api_key_local_provider() {
        // ollama requires no key
        validate_api_key("ollama/llama3").unwrap();
    }

    #[test]
    fn test_validate_api_key_missing() {
        // Pick a provider whose env var is very unlikely to be set in CI
        std::env::remove_var("MISTRAL_API_KEY");
        let err = validate_api_key("mistral/mistral-large").unwrap_err();
        assert!(err.to_string().contains("MISTRAL_API_KEY"));
    }

    #[test]
    fn test_context_window_known_and_fallback() {
        assert_eq!(context_window("openai/gpt-4o"), 128_000);
        assert_eq!(context_window("unknown/model"), 8_192);
    }

    #[test]
    fn test_parse_completion_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(parse_completion_response(&json).unwrap(), "hello");
    }

    #[test]
    fn test_parse_completion_response_missing_content() {
        let json = serde_json::json!({"choices": []});
        assert!(parse_completion_response(&json).is_err());
    }
}
