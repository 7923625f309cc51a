//! Crate-level error type

use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::llm::TransportError;

/// Errors surfaced by the relay's public operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Configuration(err.to_string())
    }
}

impl From<prometheus::Error> for RelayError {
    fn from(err: prometheus::Error) -> Self {
        RelayError::Internal(format!("metrics: {}", err))
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, RelayError>;
