use async_trait::async_trait;

use crate::error::{Error, Result};

/// Language-model collaborator used by the interaction detector's fallback
/// and the grounding checker. Always invoked as an independent pass over
/// already-produced material; it never generates or edits answers.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Strip a surrounding markdown code fence from a model response, if present.
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_prefix
        .strip_suffix("```")
        .unwrap_or(without_prefix)
        .trim()
}

/// Match a model response against an allowed vocabulary (case-insensitive,
/// fences and quotes tolerated). Anything else is out-of-vocabulary and must
/// be surfaced, never coerced to a default.
pub(crate) fn parse_constrained<T: Copy>(raw: &str, vocabulary: &[(&str, T)]) -> Result<T> {
    let cleaned = strip_code_fence(raw).trim_matches(|c| c == '"' || c == '\'' || c == '.');
    vocabulary
        .iter()
        .find(|(word, _)| word.eq_ignore_ascii_case(cleaned))
        .map(|(_, value)| *value)
        .ok_or_else(|| Error::ClassificationOutOfVocabulary {
            raw: raw.to_string(),
        })
}

/// OpenRouter-backed model, matching how the surrounding services build
/// their agents.
#[cfg(feature = "rig")]
pub mod openrouter {
    use rig::completion::Prompt;
    use rig::prelude::*;

    use super::*;

    pub struct OpenRouterModel {
        api_key: String,
        model: String,
    }

    impl OpenRouterModel {
        /// Reads `OPENROUTER_API_KEY`; the model name defaults to a small
        /// instruction-tuned model suitable for classification passes.
        pub fn from_env() -> Result<Self> {
            let api_key = std::env::var("OPENROUTER_API_KEY")
                .map_err(|_| Error::Model("OPENROUTER_API_KEY not set".to_string()))?;
            let model = std::env::var("RX_GROUND_MODEL")
                .unwrap_or_else(|_| "openai/gpt-4.1-mini".to_string());
            Ok(Self { api_key, model })
        }
    }

    #[async_trait]
    impl LanguageModel for OpenRouterModel {
        async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
            let client = rig::providers::openrouter::Client::new(&self.api_key);
            let agent = client.agent(&self.model).preamble(system).build();
            agent
                .prompt(prompt)
                .await
                .map_err(|e| Error::Model(e.to_string()))
        }
    }
}
