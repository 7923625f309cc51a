//! End-to-end tests for the relay application context

use async_trait::async_trait;
use chat_relay::config::Config;
use chat_relay::context::{Message, MessageRole};
use chat_relay::dispatch::{DispatchError, TokenUsage};
use chat_relay::llm::{ChatClient, ChatResponse, RequestConfig, TransportError};
use chat_relay::{Relay, RelayError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Answers chat turns and summary requests differently
#[derive(Default)]
struct ScriptedClient {
    chat_calls: AtomicUsize,
    summary_calls: AtomicUsize,
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn chat(
        &self,
        messages: &[Message],
        config: &RequestConfig,
    ) -> Result<ChatResponse, TransportError> {
        // Summary requests carry their own token cap.
        if config.max_tokens == Some(512) {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ChatResponse {
                content: "Short recap.".to_string(),
                model: "scripted".to_string(),
                usage: None,
                finish_reason: Some("stop".to_string()),
            });
        }

        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(ChatResponse {
            content: format!("echo: {}", last),
            model: "scripted".to_string(),
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            finish_reason: Some("stop".to_string()),
        })
    }

    fn default_model(&self) -> &str {
        "scripted"
    }
}

struct DownClient;

#[async_trait]
impl ChatClient for DownClient {
    async fn chat(&self, _: &[Message], _: &RequestConfig) -> Result<ChatResponse, TransportError> {
        Err(TransportError::Upstream {
            status: 502,
            body: "bad gateway".to_string(),
        })
    }

    fn default_model(&self) -> &str {
        "down"
    }
}

fn config_with_budget(budget: usize) -> Config {
    let mut config = Config::default();
    config.compression.max_context_characters = budget;
    config
}

/// Wait until background compression has settled
///
/// Replies appended while a compression runs can leave the log over budget;
/// the next check schedules another pass.
async fn settle(relay: &Relay, conversation_id: &str) {
    let log = relay.conversation(conversation_id).unwrap();
    for _ in 0..200 {
        if !log.compression_in_progress() {
            if !log.is_over_budget() {
                return;
            }
            relay.engine().schedule_compression_if_needed(&log);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_chat_turn_records_both_messages() {
    let client = Arc::new(ScriptedClient::default());
    let relay = Relay::new(Config::default(), client.clone()).unwrap();

    let response = relay.chat("room-1", "hello").await.unwrap();
    assert_eq!(response.content, "echo: hello");

    let messages = relay.conversation("room-1").unwrap().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);

    let metadata = messages[1].metadata.clone().unwrap();
    assert_eq!(metadata.total_tokens, Some(15));
    assert_eq!(metadata.model.as_deref(), Some("scripted"));

    let stats = relay.stats();
    assert_eq!(stats.completed_requests, 1);
    assert_eq!(stats.prompt_tokens, 10);
    assert_eq!(stats.total_tokens, 15);
    assert_eq!(stats.token_efficiency(), 0.5);
}

#[tokio::test]
async fn test_transport_failure_surfaces_to_caller() {
    let relay = Relay::new(Config::default(), Arc::new(DownClient)).unwrap();

    let result = relay.chat("room-1", "hello").await;
    match result {
        Err(RelayError::Dispatch(DispatchError::ExecutionFailed { cause, .. })) => {
            assert!(cause.contains("502"));
        }
        other => panic!("unexpected result: {:?}", other.map(|r| r.content)),
    }

    // The user message stays; no reply was recorded.
    assert_eq!(relay.conversation("room-1").unwrap().len(), 1);
    assert_eq!(relay.stats().failed_requests, 1);
}

#[tokio::test]
async fn test_over_budget_conversation_is_summarized() {
    let client = Arc::new(ScriptedClient::default());
    let relay = Relay::new(config_with_budget(400), client.clone()).unwrap();

    relay.append("room-1", Message::system("Stay on topic."));
    for i in 0..6 {
        relay.chat("room-1", format!("{:.<60}", i)).await.unwrap();
    }
    settle(&relay, "room-1").await;

    let log = relay.conversation("room-1").unwrap();
    assert!(log.total_characters() <= 400);
    assert!(client.summary_calls.load(Ordering::SeqCst) >= 1);

    let messages = log.messages();
    assert_eq!(messages[0].content, "Stay on topic.");
    assert!(messages.iter().any(|m| m.is_summary()));
}

#[tokio::test]
async fn test_pruning_without_summarizer() {
    let relay = Relay::with_components(
        config_with_budget(200),
        Arc::new(ScriptedClient::default()),
        None,
        None,
    )
    .unwrap();

    for i in 0..10 {
        relay.append("room-2", Message::user(format!("{:#<50}", i)));
        settle(&relay, "room-2").await;
    }

    let log = relay.conversation("room-2").unwrap();
    assert!(log.total_characters() <= 200);
    assert!(log.messages().iter().all(|m| !m.is_summary()));
}

#[tokio::test]
async fn test_apply_config_updates_live_budgets() {
    let relay = Relay::new(config_with_budget(10_000), Arc::new(ScriptedClient::default())).unwrap();
    relay.append("a", Message::user("hi"));
    relay.append("b", Message::user("hi"));

    relay.apply_config(config_with_budget(1_234)).unwrap();

    assert_eq!(relay.conversation("a").unwrap().budget(), 1_234);
    assert_eq!(relay.conversation("b").unwrap().budget(), 1_234);
    assert_eq!(relay.registry().default_budget(), 1_234);
    assert_eq!(relay.config().compression.max_context_characters, 1_234);

    assert!(relay.apply_config(config_with_budget(0)).is_err());
    assert_eq!(relay.conversation("a").unwrap().budget(), 1_234);
}

#[tokio::test]
async fn test_shutdown_refuses_new_turns() {
    let relay = Relay::new(Config::default(), Arc::new(ScriptedClient::default())).unwrap();
    assert!(relay.is_healthy());

    relay.shutdown().await;
    assert!(!relay.is_healthy());

    let result = relay.chat("room-1", "anyone?").await;
    assert!(matches!(
        result,
        Err(RelayError::Dispatch(DispatchError::ShutDown { .. }))
    ));
}
