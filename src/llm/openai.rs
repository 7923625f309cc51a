//! OpenAI-compatible chat completions client with retry

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{ChatClient, ChatResponse, RequestConfig, TransportError};
use crate::config::LlmConfig;
use crate::context::{Message, MessageRole};
use crate::dispatch::TokenUsage;

/// Client for `/chat/completions` style endpoints
pub struct OpenAiCompatClient {
    http: Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| TransportError::Configuration(e.to_string()))?;

        Ok(Self { http, config })
    }

    fn build_request<'a>(&'a self, messages: &'a [Message], config: &'a RequestConfig) -> CompletionRequest<'a> {
        CompletionRequest {
            model: config.model.as_deref().unwrap_or(&self.config.model),
            messages: messages.iter().map(WireMessage::from).collect(),
            temperature: config.temperature.unwrap_or(self.config.temperature),
            max_tokens: config.max_tokens.unwrap_or(self.config.max_tokens),
        }
    }

    async fn send_once(&self, request: &CompletionRequest<'_>) -> Result<ChatResponse, TransportError> {
        let mut req = self.http.post(&self.config.api_url).json(request);

        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(e.to_string())
            } else {
                TransportError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TransportError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::InvalidResponse("No choices in response".to_string()))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            model: completion.model.unwrap_or_else(|| request.model.to_string()),
            usage: completion.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    /// Exponential backoff with up to 25% random jitter
    fn calculate_backoff(&self, attempt: usize) -> Duration {
        let base = self.config.retry_backoff();
        let multiplier = 2_u32.saturating_pow(attempt.saturating_sub(1) as u32);
        let delay = base.saturating_mul(multiplier);

        let jitter_ceiling = delay.as_millis() as u64 / 4;
        if jitter_ceiling == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        delay + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn chat(
        &self,
        messages: &[Message],
        config: &RequestConfig,
    ) -> Result<ChatResponse, TransportError> {
        let request = self.build_request(messages, config);
        debug!(
            model = request.model,
            messages = messages.len(),
            "Sending chat completion request"
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if !e.is_retryable() || attempt > self.config.retry_attempts => {
                    error!("Chat completion failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let backoff = self.calculate_backoff(attempt);
                    warn!(
                        "Chat completion attempt {} failed: {}, retrying in {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

impl<'a> From<&'a Message> for WireMessage<'a> {
    fn from(message: &'a Message) -> Self {
        let tool_call_id = match message.role {
            MessageRole::Tool => message
                .metadata
                .as_ref()
                .and_then(|m| m.function_call_id.as_deref()),
            _ => None,
        };
        Self {
            role: message.role.as_str(),
            content: &message.content,
            tool_call_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    const COMPLETION: &str = r#"{
        "id": "chatcmpl-1",
        "model": "test-model",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello there"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
    }"#;

    fn config_for(server: &mockito::ServerGuard) -> LlmConfig {
        LlmConfig {
            api_url: format!("{}/v1/chat/completions", server.url()),
            api_key: Some(SecretString::new("sk-test".to_string())),
            model: "test-model".to_string(),
            retry_attempts: 2,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chat_parses_reply_and_usage() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(COMPLETION)
            .create_async()
            .await;

        let client = OpenAiCompatClient::new(config_for(&server)).unwrap();
        let response = client
            .chat(&[Message::user("Hi")], &RequestConfig::default())
            .await
            .unwrap();

        assert_eq!(response.content, "Hello there");
        assert_eq!(response.model, "test-model");
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(11));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .expect(3)
            .create_async()
            .await;

        let client = OpenAiCompatClient::new(config_for(&server)).unwrap();
        let result = client
            .chat(&[Message::user("Hi")], &RequestConfig::default())
            .await;

        assert!(matches!(result, Err(TransportError::Upstream { status: 503, .. })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let client = OpenAiCompatClient::new(config_for(&server)).unwrap();
        let result = client
            .chat(&[Message::user("Hi")], &RequestConfig::default())
            .await;

        assert!(matches!(result, Err(TransportError::Upstream { status: 400, .. })));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_request_overrides_and_tool_ids() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "summary-model",
                "max_tokens": 512,
                "messages": [
                    {"role": "user", "content": "call it"},
                    {"role": "tool", "content": "42", "tool_call_id": "call_1"}
                ]
            })))
            .with_status(200)
            .with_body(COMPLETION)
            .create_async()
            .await;

        let client = OpenAiCompatClient::new(config_for(&server)).unwrap();
        let overrides = RequestConfig::default()
            .with_model("summary-model")
            .with_max_tokens(512);
        client
            .chat(&[Message::user("call it"), Message::tool("42", "call_1")], &overrides)
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let config = LlmConfig {
            retry_backoff_ms: 100,
            ..Default::default()
        };
        let client = OpenAiCompatClient::new(config).unwrap();

        let first = client.calculate_backoff(1);
        let third = client.calculate_backoff(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
    }
}
