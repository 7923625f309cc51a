//! Summarization strategies for conversation compression

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::models::Message;
use crate::config::LlmConfig;
use crate::llm::{ChatClient, RequestConfig, TransportError};

const SUMMARY_TEMPERATURE: f32 = 0.3;
const SUMMARY_MAX_TOKENS: u32 = 512;

const SUMMARIZER_INSTRUCTIONS: &str = "You are a concise summarizer. \
    Extract key information and compress it efficiently.";

/// Condenses a block of messages into a single piece of text
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizerError>;

    /// Cheap readiness check consulted before scheduling a summary
    fn is_available(&self) -> bool {
        true
    }

    /// Key used for the circuit breaker
    fn name(&self) -> &str;
}

/// Summarizer that asks the LLM for a condensed transcript
pub struct LlmSummarizer {
    client: Arc<dyn ChatClient>,
    request: RequestConfig,
    name: String,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            client,
            request: RequestConfig::default()
                .with_model(model.clone())
                .with_temperature(SUMMARY_TEMPERATURE)
                .with_max_tokens(SUMMARY_MAX_TOKENS),
            name: format!("summarize:{}", model),
        }
    }

    /// Use the configured compression model, or the chat model
    pub fn from_config(client: Arc<dyn ChatClient>, config: &LlmConfig) -> Self {
        Self::new(client, config.effective_compression_model())
    }

    fn build_prompt(messages: &[Message]) -> String {
        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Summarize the following conversation concisely. \
            Keep the key facts, decisions, and topics discussed so the \
            conversation can continue without the original messages.\n\n{}",
            transcript
        )
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizerError> {
        if messages.is_empty() {
            return Err(SummarizerError::Empty);
        }

        debug!("Summarizing {} messages with {}", messages.len(), self.name);

        let prompt = [
            Message::system(SUMMARIZER_INSTRUCTIONS),
            Message::user(Self::build_prompt(messages)),
        ];

        let response = self
            .client
            .chat(&prompt, &self.request)
            .await
            .map_err(SummarizerError::from)?;

        let summary = response.content.trim();
        if summary.is_empty() {
            warn!("Summarizer returned an empty reply");
            return Err(SummarizerError::Empty);
        }
        Ok(summary.to_string())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Deterministic role-prefixed concatenation, for offline runs and tests
pub struct ConcatenationSummarizer;

#[async_trait]
impl Summarizer for ConcatenationSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, SummarizerError> {
        if messages.is_empty() {
            return Err(SummarizerError::Empty);
        }
        Ok(messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn name(&self) -> &str {
        "concatenation"
    }
}

/// Summarizer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SummarizerError {
    #[error("Summarization unavailable: {0}")]
    Unavailable(String),

    #[error("Summarization timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Summarizer returned no text")]
    Empty,
}

impl From<TransportError> for SummarizerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Request(e) | TransportError::Timeout(e) => SummarizerError::Network(e),
            other => SummarizerError::Api(other.to_string()),
        }
    }
}
