//! LLM transport interface
//!
//! The relay only needs "send these messages, get a reply with usage"; the
//! wire protocol lives behind [`ChatClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Message;
use crate::dispatch::{CarriesUsage, TokenUsage};

pub mod openai;

pub use openai::OpenAiCompatClient;

/// Per-call overrides; unset fields fall back to the client's defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl RequestConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Assistant reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

impl CarriesUsage for ChatResponse {
    fn token_usage(&self) -> Option<TokenUsage> {
        self.usage
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client configuration error: {0}")]
    Configuration(String),
}

impl TransportError {
    /// Network trouble, throttling and server errors are worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(_) | TransportError::Timeout(_) => true,
            TransportError::Upstream { status, .. } => *status == 429 || *status >= 500,
            TransportError::InvalidResponse(_) | TransportError::Configuration(_) => false,
        }
    }
}

/// Chat-completion transport
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        messages: &[Message],
        config: &RequestConfig,
    ) -> Result<ChatResponse, TransportError>;

    /// Model used when a request does not name one
    fn default_model(&self) -> &str;
}
