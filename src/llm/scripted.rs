//! In-memory model backend that replays canned replies, for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError};

pub(crate) struct ScriptedClient {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, ChatOptions)>>,
}

impl ScriptedClient {
    pub(crate) fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The last user message of every request, in order.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(messages, _)| messages.last().map(|m| m.content.clone()))
            .collect()
    }

    pub(crate) fn last_options(&self) -> Option<ChatOptions> {
        self.requests.lock().unwrap().last().map(|(_, o)| o.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), options.clone()));
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network_error("script exhausted".into())));
        next.map(|content| ChatResponse {
            content,
            finish_reason: Some("stop".into()),
            usage: None,
            model: Some(model.to_string()),
        })
    }
}
