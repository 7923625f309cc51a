//! Application context wiring dispatcher, compression and conversations

use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{
    CompressionEngine, CompressionListener, ConversationLog, ConversationRegistry, LlmSummarizer,
    Message, MessageMetadata, Summarizer, DEFAULT_CLEANUP_INTERVAL,
};
use crate::dispatch::{RequestDispatcher, StatsSnapshot};
use crate::error::{RelayError, Result};
use crate::llm::{ChatClient, ChatResponse, OpenAiCompatClient, RequestConfig};
use crate::metrics::RelayMetrics;

/// Explicitly constructed relay; owns every shared component
pub struct Relay {
    config: RwLock<Config>,
    dispatcher: RequestDispatcher,
    engine: CompressionEngine,
    registry: Arc<ConversationRegistry>,
    client: Arc<dyn ChatClient>,
    metrics: Arc<RelayMetrics>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    /// Build a relay talking to the configured OpenAI-compatible endpoint
    pub fn from_config(config: Config) -> Result<Self> {
        let client: Arc<dyn ChatClient> = Arc::new(OpenAiCompatClient::new(config.llm.clone())?);
        Self::new(config, client)
    }

    /// Build a relay over `client`, summarizing with the same client
    pub fn new(config: Config, client: Arc<dyn ChatClient>) -> Result<Self> {
        let summarizer: Arc<dyn Summarizer> =
            Arc::new(LlmSummarizer::from_config(client.clone(), &config.llm));
        Self::with_components(config, client, Some(summarizer), None)
    }

    /// Build a relay with an explicit summarizer and listener
    ///
    /// Without a summarizer every compression prunes; without a listener
    /// compression events are logged.
    pub fn with_components(
        config: Config,
        client: Arc<dyn ChatClient>,
        summarizer: Option<Arc<dyn Summarizer>>,
        listener: Option<Arc<dyn CompressionListener>>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RelayMetrics::new()?);
        let dispatcher = RequestDispatcher::new(config.dispatcher.clone(), Some(metrics.clone()))?;

        let mut engine = CompressionEngine::new(dispatcher.clone(), config.compression.clone())
            .with_metrics(metrics.clone());
        if let Some(summarizer) = summarizer {
            engine = engine.with_summarizer(summarizer);
        }
        if let Some(listener) = listener {
            engine = engine.with_listener(listener);
        }

        let registry = Arc::new(ConversationRegistry::new(
            config.compression.max_context_characters,
            config.compression.conversation_ttl(),
        ));
        let cleanup = registry.spawn_cleanup(DEFAULT_CLEANUP_INTERVAL);

        info!(
            model = client.default_model(),
            budget = config.compression.max_context_characters,
            "Chat relay initialized"
        );

        Ok(Self {
            config: RwLock::new(config),
            dispatcher,
            engine,
            registry,
            client,
            metrics,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<ConversationRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Arc<ConversationLog>> {
        self.registry.get(conversation_id)
    }

    /// Append to a conversation and compress in the background if needed
    pub fn append(&self, conversation_id: &str, message: Message) -> Uuid {
        let log = self.registry.get_or_create(conversation_id);
        let id = log.append(message);
        self.engine.schedule_compression_if_needed(&log);
        id
    }

    /// Run one chat turn: record the user message, ask the LLM, record the reply
    pub async fn chat(&self, conversation_id: &str, content: impl Into<String>) -> Result<ChatResponse> {
        self.chat_with(conversation_id, content, RequestConfig::default())
            .await
    }

    pub async fn chat_with(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
        request: RequestConfig,
    ) -> Result<ChatResponse> {
        let log = self.registry.get_or_create(conversation_id);
        log.append_user(content);
        self.engine.schedule_compression_if_needed(&log);

        let history = log.messages();
        let client = self.client.clone();
        let request_id = format!("{}-{}", conversation_id, Uuid::new_v4());

        let response = self
            .dispatcher
            .submit(
                move || async move {
                    let response = client.chat(&history, &request).await?;
                    Ok::<_, anyhow::Error>(response)
                },
                request_id,
            )
            .await?;

        let reply_id = log.append_assistant(response.content.clone());
        if let Some(usage) = response.usage {
            log.backfill_metadata(reply_id, MessageMetadata::from_usage(usage, response.model.clone()));
        }
        self.engine.schedule_compression_if_needed(&log);

        Ok(response)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn is_healthy(&self) -> bool {
        self.dispatcher.is_healthy()
    }

    /// Apply a reloaded configuration
    ///
    /// Only the conversation budget is live; dispatcher sizing is fixed for
    /// the lifetime of the relay.
    pub fn apply_config(&self, config: Config) -> Result<()> {
        config.validate()?;

        let mut current = self
            .config
            .write()
            .map_err(|_| RelayError::Internal("configuration lock poisoned".to_string()))?;

        let budget = config.compression.max_context_characters;
        if budget != current.compression.max_context_characters {
            let updated = self.registry.update_budget(budget, None);
            info!(budget, conversations = updated, "Applied new context budget");
        }

        let old = &current.dispatcher;
        let new = &config.dispatcher;
        if old.max_concurrent_requests != new.max_concurrent_requests
            || old.queue_capacity != new.queue_capacity
            || old.core_pool_size != new.core_pool_size
            || old.max_pool_size != new.max_pool_size
        {
            warn!("Dispatcher sizing changes take effect on restart");
        }

        *current = config;
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> Config {
        self.config
            .read()
            .map(|config| config.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Observability routes bound to this relay
    pub fn router(self: &Arc<Self>) -> axum::Router {
        crate::api::router(self.clone())
    }

    /// Stop background work and drain the dispatcher
    pub async fn shutdown(&self) {
        let cleanup = self
            .cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = cleanup {
            task.abort();
        }
        self.dispatcher.shutdown().await;
        info!("Chat relay shut down");
    }
}
