//! Relay configuration
//!
//! Values come from an optional TOML file, then `CHAT_RELAY__<SECTION>__<KEY>`
//! environment variables. A `.env` file is loaded first when present.

use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};

const ENV_PREFIX: &str = "CHAT_RELAY";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load from a TOML file with environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Config>()?;

        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Config>()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the dispatcher or engine cannot run with
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.compression.validate()?;
        Ok(())
    }
}

/// Worker pool and admission gate settings
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum LLM calls in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Bounded worker queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Admission wait timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_core_pool_size")]
    pub core_pool_size: usize,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Idle time before a surplus worker retires, in milliseconds
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,

    /// Run work on the submitter when queue and pool are saturated
    #[serde(default = "default_caller_runs")]
    pub caller_runs_on_saturation: bool,

    /// Grace period for draining on shutdown, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_max_concurrent() -> usize { 10 }
fn default_queue_capacity() -> usize { 50 }
fn default_request_timeout_ms() -> u64 { 30_000 }
fn default_core_pool_size() -> usize { 5 }
fn default_max_pool_size() -> usize { 20 }
fn default_keep_alive_ms() -> u64 { 60_000 }
fn default_caller_runs() -> bool { true }
fn default_shutdown_grace_ms() -> u64 { 30_000 }

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            core_pool_size: default_core_pool_size(),
            max_pool_size: default_max_pool_size(),
            keep_alive_ms: default_keep_alive_ms(),
            caller_runs_on_saturation: default_caller_runs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(RelayError::Configuration(
                "max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Configuration(
                "queue_capacity must be positive".to_string(),
            ));
        }
        if self.core_pool_size == 0 || self.max_pool_size < self.core_pool_size {
            return Err(RelayError::Configuration(format!(
                "invalid pool sizing: core={}, max={}",
                self.core_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Context compression settings
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    /// Use the summarizer; when false every compression prunes
    #[serde(default = "default_compression_enabled")]
    pub enabled: bool,

    /// Per-conversation character budget
    #[serde(default = "default_max_context_characters")]
    pub max_context_characters: usize,

    /// Characters reserved for the summary when choosing what to keep
    #[serde(default = "default_summary_reserve")]
    pub summary_reserve_chars: usize,

    /// Timeout for the summarization call, in milliseconds
    #[serde(default = "default_summarization_timeout_ms")]
    pub summarization_timeout_ms: u64,

    /// Consecutive summarizer failures before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub circuit_breaker_failures: usize,

    #[serde(default = "default_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,

    /// Idle time after which a conversation is evicted, in seconds
    #[serde(default = "default_conversation_ttl_secs")]
    pub conversation_ttl_secs: u64,
}

fn default_compression_enabled() -> bool { true }
fn default_max_context_characters() -> usize { 100_000 }
fn default_summary_reserve() -> usize { 500 }
fn default_summarization_timeout_ms() -> u64 { 20_000 }
fn default_breaker_failures() -> usize { 5 }
fn default_breaker_reset_secs() -> u64 { 60 }
fn default_conversation_ttl_secs() -> u64 { 7_200 }

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: default_compression_enabled(),
            max_context_characters: default_max_context_characters(),
            summary_reserve_chars: default_summary_reserve(),
            summarization_timeout_ms: default_summarization_timeout_ms(),
            circuit_breaker_failures: default_breaker_failures(),
            circuit_breaker_reset_secs: default_breaker_reset_secs(),
            conversation_ttl_secs: default_conversation_ttl_secs(),
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_context_characters == 0 {
            return Err(RelayError::Configuration(
                "max_context_characters must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn summarization_timeout(&self) -> Duration {
        Duration::from_millis(self.summarization_timeout_ms)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }

    pub fn conversation_ttl(&self) -> Duration {
        Duration::from_secs(self.conversation_ttl_secs)
    }
}

/// Upstream LLM endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: Option<SecretString>,

    #[serde(default = "default_model")]
    pub model: String,

    /// Model used for summaries; falls back to `model`
    #[serde(default)]
    pub compression_model: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_api_url() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 1024 }
fn default_http_timeout_ms() -> u64 { 60_000 }
fn default_retry_attempts() -> usize { 3 }
fn default_retry_backoff_ms() -> u64 { 1_000 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            compression_model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_http_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Model to use for summarization requests
    pub fn effective_compression_model(&self) -> &str {
        self.compression_model.as_deref().unwrap_or(&self.model)
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Observability endpoint settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8081 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
