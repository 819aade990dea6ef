use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::prompts;
use crate::llm::{ChatMessage, GenerationMode, LlmClient, LlmError};
use crate::task::{ErrorInfo, ExecutionRecord, PlanStep, Task};

/// Conversation with the model for one task.
///
/// Holds the system prompt and a bounded history; the oldest messages are
/// dropped first. Every call is bounded by the configured timeout.
pub struct ModelSession {
    client: Arc<dyn LlmClient>,
    model: String,
    system_prompt: String,
    history: VecDeque<ChatMessage>,
    window: usize,
    timeout: Duration,
}

impl ModelSession {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: impl Into<String>,
        system_prompt: String,
        window: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_prompt,
            history: VecDeque::new(),
            window: window.max(1),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    async fn exchange(&mut self, prompt: String, mode: GenerationMode) -> Result<String, LlmError> {
        self.history.push_back(ChatMessage::user(prompt));
        self.trim();

        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());

        match self.call(&messages, mode).await {
            Ok(reply) => {
                self.history.push_back(ChatMessage::assistant(reply.clone()));
                self.trim();
                Ok(reply)
            }
            Err(e) => {
                // Keep the history a sequence of answered prompts.
                self.history.pop_back();
                Err(e)
            }
        }
    }

    async fn call(&self, messages: &[ChatMessage], mode: GenerationMode) -> Result<String, LlmError> {
        let options = mode.options();
        let request = self.client.chat_completion(&self.model, messages, &options);
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                LlmError::timeout(format!(
                    "model did not answer within {} seconds",
                    self.timeout.as_secs()
                ))
            })??;
        debug!(
            "Model reply ({} chars, finish: {:?})",
            response.content.len(),
            response.finish_reason
        );
        Ok(response.content)
    }

    fn trim(&mut self) {
        while self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    pub async fn plan(&mut self, task: &Task) -> Result<String, LlmError> {
        self.exchange(prompts::plan_prompt(task), GenerationMode::Planning).await
    }

    pub async fn correct(&mut self, step: &PlanStep, error: &ErrorInfo) -> Result<String, LlmError> {
        self.exchange(prompts::correction_prompt(step, error), GenerationMode::Planning)
            .await
    }

    pub async fn verify(&mut self, task: &Task, record: &ExecutionRecord) -> Result<String, LlmError> {
        self.exchange(prompts::verification_prompt(task, record), GenerationMode::Planning)
            .await
    }

    pub async fn converse(&mut self, text: &str) -> Result<String, LlmError> {
        self.exchange(text.to_string(), GenerationMode::Conversational)
            .await
    }

    /// One tiny request outside the history, to check the backend answers.
    pub async fn check_connection(&self) -> Result<(), LlmError> {
        let messages = [ChatMessage::user("ping")];
        let mut options = GenerationMode::Conversational.options();
        options.max_tokens = Some(1);
        let request = self.client.chat_completion(&self.model, &messages, &options);
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| LlmError::timeout("connectivity check timed out".to_string()))??;
        Ok(())
    }
}
