//! LLM client module for interacting with language models.
//!
//! This module provides a trait-based abstraction over model backends, with a
//! local Ollama server as the primary implementation and OpenRouter as a
//! hosted alternative.

mod error;
mod ollama;
mod openrouter;

#[cfg(test)]
pub(crate) mod scripted;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use ollama::{OllamaClient, DEFAULT_OLLAMA_URL};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Response from a chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: Option<String>,
}

/// Token usage information (if provided by the backend).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Generation parameters for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Sampling temperature (0 = deterministic).
    pub temperature: Option<f64>,
    /// Top-p nucleus sampling.
    pub top_p: Option<f64>,
    /// Maximum output tokens to generate.
    pub max_tokens: Option<u64>,
    /// Context window in tokens (backends that support it).
    pub context_window: Option<u64>,
    pub repeat_penalty: Option<f64>,
    pub stop: Vec<String>,
}

/// The two operating configurations the agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    /// Low temperature, short output, stop sequences that cut off trailing prose.
    Planning,
    /// Free-form replies to questions.
    Conversational,
}

impl GenerationMode {
    pub fn options(self) -> ChatOptions {
        match self {
            GenerationMode::Planning => ChatOptions {
                temperature: Some(0.1),
                top_p: Some(0.85),
                max_tokens: Some(768),
                context_window: Some(2048),
                repeat_penalty: Some(1.2),
                stop: ["\n\n\n", "Explanation:", "Note:", "```\n\n"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
            GenerationMode::Conversational => ChatOptions {
                temperature: Some(0.5),
                top_p: Some(0.85),
                max_tokens: Some(1024),
                context_window: Some(2048),
                repeat_penalty: Some(1.2),
                stop: Vec::new(),
            },
        }
    }
}

/// Trait for LLM clients.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short backend name for logs and the status screen.
    fn provider(&self) -> &str;

    /// Send a chat completion request.
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_mode_is_colder_than_conversation() {
        let planning = GenerationMode::Planning.options();
        let chat = GenerationMode::Conversational.options();
        assert!(planning.temperature < chat.temperature);
        assert!(planning.stop.iter().any(|s| s == "Explanation:"));
        assert!(chat.stop.is_empty());
        assert_eq!(planning.context_window, Some(2048));
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(u64::MAX, 5);
        assert_eq!(usage.total_tokens, u64::MAX);
    }
}
