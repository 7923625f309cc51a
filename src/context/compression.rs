//! Background compression of over-budget conversations
//!
//! A conversation over its character budget gets one background task at a
//! time. The task tries to replace the oldest messages with an LLM summary and
//! falls back to deleting them when no summary can be had.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::conversation::{CompressionGuard, ConversationLog};
use super::models::Message;
use super::summarizer::{Summarizer, SummarizerError};
use crate::config::CompressionConfig;
use crate::dispatch::{DispatchError, RequestDispatcher};
use crate::metrics::RelayMetrics;

const SUMMARY_HEADER: &str = "=== Conversation summary ===";
const SUMMARY_FOOTER: &str = "=== Recent conversation follows ===";

/// Observer of compression runs
///
/// Panics raised by implementations are caught and logged.
pub trait CompressionListener: Send + Sync {
    fn on_compression_started(&self, conversation_id: &str, messages_to_compress: usize);

    /// Counts are the log's message counts before and after the run
    fn on_compression_completed(
        &self,
        conversation_id: &str,
        success: bool,
        original_count: usize,
        compressed_count: usize,
    );
}

/// Default listener: logs both events
pub struct TracingCompressionListener;

impl CompressionListener for TracingCompressionListener {
    fn on_compression_started(&self, conversation_id: &str, messages_to_compress: usize) {
        info!(
            conversation_id,
            messages_to_compress, "Context compression started"
        );
    }

    fn on_compression_completed(
        &self,
        conversation_id: &str,
        success: bool,
        original_count: usize,
        compressed_count: usize,
    ) {
        if success {
            info!(
                conversation_id,
                original_count, compressed_count, "Context compressed with summary"
            );
        } else {
            warn!(
                conversation_id,
                original_count, compressed_count, "Context compressed by pruning"
            );
        }
    }
}

/// Result of one compression run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOutcome {
    /// True when a summary replaced the compressed block
    pub summarized: bool,
    pub removed: usize,
    pub original_count: usize,
    pub compressed_count: usize,
}

/// Pick the oldest block of unpinned messages to compress
///
/// Returns `None` when fewer than two unpinned messages exist, since no
/// compression can then make progress.
pub fn plan_compression(messages: &[Message], budget: usize, reserve_chars: usize) -> Option<Vec<Message>> {
    let (pinned, candidates): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| m.is_pinned());

    if candidates.len() < 2 {
        return None;
    }

    let pinned_chars: usize = pinned.iter().map(|m| m.char_len()).sum();
    let reserve = reserve_chars.min(budget / 4);
    let retained_floor = if candidates.len() > 2 { 2 } else { 1 };
    let most_compressible = candidates.len() - retained_floor;

    let wanted = match budget.checked_sub(pinned_chars + reserve) {
        Some(available) if available > 0 => {
            let mut kept_chars = 0;
            let kept = candidates
                .iter()
                .rev()
                .take_while(|m| {
                    kept_chars += m.char_len();
                    kept_chars <= available
                })
                .count();
            candidates.len() - kept
        }
        _ => candidates.len() / 2,
    };

    let count = wanted.clamp(1, most_compressible);
    Some(candidates[..count].iter().map(|m| (*m).clone()).collect())
}

/// Wrap a summary in the markers used for synthetic messages
pub fn format_summary(summary: &str) -> String {
    format!("{}\n{}\n{}", SUMMARY_HEADER, summary, SUMMARY_FOOTER)
}

/// Schedules and runs per-conversation compression
#[derive(Clone)]
pub struct CompressionEngine {
    dispatcher: RequestDispatcher,
    summarizer: Option<Arc<dyn Summarizer>>,
    listener: Arc<dyn CompressionListener>,
    breaker: Arc<CircuitBreaker>,
    metrics: Option<Arc<RelayMetrics>>,
    config: CompressionConfig,
}

impl CompressionEngine {
    pub fn new(dispatcher: RequestDispatcher, config: CompressionConfig) -> Self {
        Self {
            dispatcher,
            summarizer: None,
            listener: Arc::new(TracingCompressionListener),
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from(&config))),
            metrics: None,
            config,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CompressionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Start a background compression when the log is over budget
    ///
    /// Never blocks. Returns true only when this call started a task; an
    /// in-budget log or one already being compressed is left alone.
    pub fn schedule_compression_if_needed(&self, log: &Arc<ConversationLog>) -> bool {
        let total = log.total_characters();
        let budget = log.budget();
        if total <= budget {
            return false;
        }

        let Some(guard) = log.try_begin_compression() else {
            debug!(conversation_id = log.id(), "Compression already in progress");
            return false;
        };

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(conversation_id = log.id(), "Cannot schedule compression: {}", e);
                return false;
            }
        };

        debug!(
            conversation_id = log.id(),
            total, budget, "Scheduling context compression"
        );

        let engine = self.clone();
        runtime.spawn(async move {
            engine.run(guard).await;
        });
        true
    }

    /// Compress on the current task, if over budget and not already running
    pub async fn compress_now(&self, log: &Arc<ConversationLog>) -> Option<CompressionOutcome> {
        let guard = log.try_begin_compression()?;
        self.run(guard).await
    }

    async fn run(&self, guard: CompressionGuard) -> Option<CompressionOutcome> {
        let log = guard.log().clone();
        let conversation_id = log.id().to_string();

        if !log.is_over_budget() {
            return None;
        }

        let snapshot = log.messages();
        let original_count = snapshot.len();
        let Some(block) =
            plan_compression(&snapshot, log.budget(), self.config.summary_reserve_chars)
        else {
            debug!(
                conversation_id = %conversation_id,
                "Not enough unpinned messages to compress"
            );
            return None;
        };

        self.notify(|listener| listener.on_compression_started(&conversation_id, block.len()));

        let replaced: Vec<_> = block.iter().map(|m| m.id).collect();
        let (summarized, removed) = match self.summarize(&conversation_id, block).await {
            Ok(summary) => {
                match log.replace_with_summary(&replaced, Message::summary(format_summary(&summary))) {
                    0 => {
                        debug!(
                            conversation_id = %conversation_id,
                            "Summarized messages are gone, discarding summary"
                        );
                        (false, self.prune(&log))
                    }
                    removed => (true, removed),
                }
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    "Summarization failed, falling back to pruning: {}", e
                );
                (false, self.prune(&log))
            }
        };

        let compressed_count = log.len();
        if let Some(metrics) = &self.metrics {
            metrics.record_compression(summarized, removed);
        }

        self.notify(|listener| {
            listener.on_compression_completed(&conversation_id, summarized, original_count, compressed_count)
        });

        debug!(
            conversation_id = %conversation_id,
            total = log.total_characters(),
            budget = log.budget(),
            "Context compression finished"
        );

        drop(guard);
        Some(CompressionOutcome {
            summarized,
            removed,
            original_count,
            compressed_count,
        })
    }

    /// Summarize through the dispatcher, bounded by the summarization timeout
    async fn summarize(&self, conversation_id: &str, block: Vec<Message>) -> Result<String, SummarizerError> {
        if !self.config.enabled {
            return Err(SummarizerError::Unavailable("summaries disabled".to_string()));
        }

        let summarizer = self
            .summarizer
            .clone()
            .ok_or_else(|| SummarizerError::Unavailable("no summarizer configured".to_string()))?;

        if !summarizer.is_available() {
            return Err(SummarizerError::Unavailable(format!("{} not ready", summarizer.name())));
        }

        let key = summarizer.name().to_string();
        if self.breaker.is_open(&key) {
            return Err(SummarizerError::Unavailable(format!("circuit open for {}", key)));
        }

        let timeout = self.config.summarization_timeout();
        let mut handle = self.dispatcher.submit(
            move || async move {
                let summary = summarizer.summarize(&block).await?;
                Ok::<_, anyhow::Error>(summary)
            },
            format!("compress-{}", conversation_id),
        );

        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                // Stop the queued or running call so it does not hold a permit.
                handle.cancel();
                Err(SummarizerError::Timeout(timeout))
            }
            Ok(Ok(summary)) if summary.trim().is_empty() => Err(SummarizerError::Empty),
            Ok(Ok(summary)) => Ok(summary.trim().to_string()),
            Ok(Err(DispatchError::Timeout { waited, .. })) => Err(SummarizerError::Timeout(waited)),
            Ok(Err(DispatchError::ExecutionFailed { cause, .. })) => Err(SummarizerError::Api(cause)),
            Ok(Err(other)) => Err(SummarizerError::Unavailable(other.to_string())),
        };

        match &result {
            Ok(_) => self.breaker.mark_success(&key),
            Err(_) => self.breaker.mark_failure(&key),
        }
        result
    }

    /// Delete oldest unpinned messages until within budget
    fn prune(&self, log: &ConversationLog) -> usize {
        let mut removed = 0;
        while log.total_characters() > log.budget() {
            if log.remove_oldest_unpinned().is_none() {
                break;
            }
            removed += 1;
        }
        removed
    }

    fn notify(&self, event: impl FnOnce(&dyn CompressionListener)) {
        let listener = self.listener.as_ref();
        if catch_unwind(AssertUnwindSafe(|| event(listener))).is_err() {
            error!("Compression listener panicked");
        }
    }
}
