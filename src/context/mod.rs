//! Conversation context with character-budget enforcement
//!
//! Each conversation keeps its transcript under a character budget. Going
//! over budget schedules a single background compression that summarizes the
//! oldest messages, or prunes them when no summary is available.

pub mod circuit_breaker;
pub mod compression;
pub mod conversation;
pub mod models;
pub mod registry;
pub mod summarizer;

pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker, CircuitBreakerConfig};
pub use compression::{
    format_summary, plan_compression, CompressionEngine, CompressionListener, CompressionOutcome,
    TracingCompressionListener,
};
pub use conversation::{CompressionGuard, ConversationLog};
pub use models::{Message, MessageMetadata, MessageRole};
pub use registry::{ConversationRegistry, DEFAULT_CLEANUP_INTERVAL};
pub use summarizer::{ConcatenationSummarizer, LlmSummarizer, Summarizer, SummarizerError};
