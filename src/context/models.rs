//! Data models for conversation context

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::TokenUsage;

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    /// Wire name used by OpenAI-compatible APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional per-message metadata, backfilled after the LLM call returns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Id of the function call this message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call_id: Option<String>,

    /// Set on synthetic messages produced by compression
    #[serde(default)]
    pub summary: bool,
}

impl MessageMetadata {
    pub fn from_usage(usage: TokenUsage, model: impl Into<String>) -> Self {
        Self {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
            total_tokens: Some(usage.total_tokens),
            model: Some(model.into()),
            ..Default::default()
        }
    }
}

/// One entry in a conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Tool output answering the given function call
    pub fn tool(content: impl Into<String>, function_call_id: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content).with_metadata(MessageMetadata {
            function_call_id: Some(function_call_id.into()),
            ..Default::default()
        })
    }

    /// Synthetic system message carrying a compression summary
    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content).with_metadata(MessageMetadata {
            summary: true,
            ..Default::default()
        })
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Length in Unicode scalar values
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn is_summary(&self) -> bool {
        self.metadata.as_ref().map_or(false, |m| m.summary)
    }

    /// System instructions survive every compression; summaries do not
    pub fn is_pinned(&self) -> bool {
        self.role == MessageRole::System && !self.is_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_len_counts_scalars() {
        let message = Message::user("héllo wörld");
        assert_eq!(message.char_len(), 11);
        assert!(message.content.len() > 11);
    }

    #[test]
    fn test_pinning() {
        assert!(Message::system("You are helpful.").is_pinned());
        assert!(!Message::summary("Earlier we talked.").is_pinned());
        assert!(Message::summary("Earlier we talked.").is_summary());
        assert!(!Message::user("hi").is_pinned());
    }

    #[test]
    fn test_tool_message_carries_call_id() {
        let message = Message::tool("42", "call_7");
        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(
            message.metadata.and_then(|m| m.function_call_id).as_deref(),
            Some("call_7")
        );
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
