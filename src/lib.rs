//! Chat relay
//!
//! Sits between chat clients and a remote LLM endpoint:
//!
//! - [`dispatch`] bounds concurrent LLM calls behind a FIFO admission gate and
//!   a bounded worker pool, with request and token accounting.
//! - [`context`] keeps each conversation under a character budget by
//!   summarizing or pruning old messages in the background.
//! - [`relay::Relay`] wires both together with an LLM client, and [`api`]
//!   exposes health, stats and Prometheus metrics over HTTP.

pub mod api;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod relay;
pub mod telemetry;

pub use config::Config;
pub use error::{RelayError, Result};
pub use relay::Relay;

/// Commonly used types
pub mod prelude {
    pub use crate::config::{CompressionConfig, Config, DispatcherConfig, LlmConfig};
    pub use crate::context::{
        CompressionEngine, CompressionListener, ConversationLog, ConversationRegistry, Message,
        MessageMetadata, MessageRole, Summarizer, SummarizerError,
    };
    pub use crate::dispatch::{
        CarriesUsage, DispatchError, RequestDispatcher, RequestHandle, StatsSnapshot, TokenUsage,
    };
    pub use crate::error::{RelayError, Result};
    pub use crate::llm::{ChatClient, ChatResponse, RequestConfig, TransportError};
    pub use crate::relay::Relay;
}
