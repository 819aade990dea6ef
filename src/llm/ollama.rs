//! Ollama client for locally served models (`POST /api/chat`, non-streaming).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
use super::{ChatMessage, ChatOptions, ChatResponse, LlmClient, TokenUsage};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Client for a local Ollama server.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    retry_config: RetryConfig,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_retry_config(base_url, RetryConfig::default())
    }

    pub fn with_retry_config(base_url: impl Into<String>, retry_config: RetryConfig) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            retry_config,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_request(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> OllamaRequest {
        OllamaRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: false,
            options: OllamaOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                num_predict: options.max_tokens,
                num_ctx: options.context_window,
                repeat_penalty: options.repeat_penalty,
                stop: options.stop.clone(),
            },
        }
    }

    async fn execute_request(&self, request: &OllamaRequest) -> Result<ChatResponse, LlmError> {
        let response = self
            .client
            .post(self.chat_url())
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::from_reqwest(&e))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let code = status.as_u16();
            return Err(match classify_http_status(code) {
                LlmErrorKind::RateLimited => LlmError::rate_limited(body, None),
                LlmErrorKind::ClientError => LlmError::client_error(code, body),
                LlmErrorKind::Timeout => LlmError::timeout(body),
                _ => LlmError::server_error(code, body),
            });
        }

        parse_response(&body, &request.model)
    }
}

fn parse_response(body: &str, requested_model: &str) -> Result<ChatResponse, LlmError> {
    let parsed: OllamaResponse = serde_json::from_str(body).map_err(|e| {
        LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
    })?;

    if let Some(error) = parsed.error {
        return Err(LlmError::client_error(400, error));
    }

    let message = parsed
        .message
        .ok_or_else(|| LlmError::parse_error("No message in response".to_string()))?;

    let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
        (Some(prompt), Some(completion)) => Some(TokenUsage::new(prompt, completion)),
        _ => None,
    };

    Ok(ChatResponse {
        content: message.content,
        finish_reason: parsed.done_reason,
        usage,
        model: parsed.model.or_else(|| Some(requested_model.to_string())),
    })
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn provider(&self) -> &str {
        "ollama"
    }

    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let request = Self::build_request(model, messages, options);
        tracing::debug!("Sending request to Ollama at {}: model={}", self.base_url, model);
        self.retry_config
            .run("Ollama request", || self.execute_request(&request))
            .await
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repeat_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationMode;

    #[test]
    fn test_request_maps_generation_options() {
        let request = OllamaClient::build_request(
            "llama3",
            &[ChatMessage::system("sys"), ChatMessage::user("hi")],
            &GenerationMode::Planning.options(),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 768);
        assert_eq!(json["options"]["num_ctx"], 2048);
        assert_eq!(json["options"]["repeat_penalty"], 1.2);
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn test_conversational_request_has_no_stop_list() {
        let request = OllamaClient::build_request(
            "llama3",
            &[],
            &GenerationMode::Conversational.options(),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert!(json["options"].get("stop").is_none());
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"model":"llama3","message":{"role":"assistant","content":"OK"},"done":true,"done_reason":"stop","prompt_eval_count":10,"eval_count":2}"#;
        let response = parse_response(body, "llama3").unwrap();
        assert_eq!(response.content, "OK");
        assert_eq!(response.usage.unwrap().total_tokens, 12);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_error_body() {
        let err = parse_response(r#"{"error":"model 'x' not found"}"#, "x").unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ClientError);
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = OllamaClient::new("http://localhost:11434/");
        assert_eq!(client.chat_url(), "http://localhost:11434/api/chat");
    }
}
