//! Live conversations keyed by conversation id

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::conversation::ConversationLog;

/// How often the cleanup task looks for idle conversations
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3_600);

pub struct ConversationRegistry {
    logs: DashMap<String, Arc<ConversationLog>>,
    default_budget: AtomicUsize,
    idle_ttl: Duration,
}

impl ConversationRegistry {
    pub fn new(default_budget: usize, idle_ttl: Duration) -> Self {
        Self {
            logs: DashMap::new(),
            default_budget: AtomicUsize::new(default_budget),
            idle_ttl,
        }
    }

    pub fn default_budget(&self) -> usize {
        self.default_budget.load(Ordering::SeqCst)
    }

    /// Fetch the log for `conversation_id`, creating it on first use
    pub fn get_or_create(&self, conversation_id: &str) -> Arc<ConversationLog> {
        if let Some(log) = self.logs.get(conversation_id) {
            return log.clone();
        }
        self.logs
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                debug!(conversation_id, "Creating conversation");
                Arc::new(ConversationLog::new(conversation_id, self.default_budget()))
            })
            .clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<ConversationLog>> {
        self.logs.get(conversation_id).map(|log| log.clone())
    }

    pub fn remove(&self, conversation_id: &str) -> Option<Arc<ConversationLog>> {
        self.logs.remove(conversation_id).map(|(_, log)| log)
    }

    pub fn clear(&self) {
        self.logs.clear();
    }

    /// Replace the conversation with an empty one under a new session id
    pub fn renew_session(&self, conversation_id: &str) -> Arc<ConversationLog> {
        let budget = self
            .get(conversation_id)
            .map_or_else(|| self.default_budget(), |log| log.budget());
        let log = Arc::new(ConversationLog::new(conversation_id, budget));
        self.logs.insert(conversation_id.to_string(), log.clone());
        info!(conversation_id, session_id = %log.session_id(), "Started new session");
        log
    }

    /// Start a new session that keeps the existing history
    pub fn renew_with_history(&self, conversation_id: &str) -> Arc<ConversationLog> {
        let (budget, history) = match self.get(conversation_id) {
            Some(old) => (old.budget(), old.messages()),
            None => (self.default_budget(), Vec::new()),
        };
        let log = Arc::new(ConversationLog::with_history(conversation_id, budget, history));
        self.logs.insert(conversation_id.to_string(), log.clone());
        info!(
            conversation_id,
            session_id = %log.session_id(),
            messages = log.len(),
            "Started new session with history"
        );
        log
    }

    /// Change the budget of one conversation, or of every conversation
    ///
    /// With no id the default for new conversations changes too. Returns the
    /// number of live conversations updated.
    pub fn update_budget(&self, budget: usize, conversation_id: Option<&str>) -> usize {
        match conversation_id {
            Some(id) => match self.logs.get(id) {
                Some(log) => {
                    log.set_budget(budget);
                    1
                }
                None => 0,
            },
            None => {
                self.default_budget.store(budget, Ordering::SeqCst);
                self.logs.iter().for_each(|entry| entry.value().set_budget(budget));
                self.logs.len()
            }
        }
    }

    /// Drop conversations idle for longer than the configured TTL
    pub fn evict_expired(&self) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| !log.is_expired(self.idle_ttl));
        let evicted = before.saturating_sub(self.logs.len());
        if evicted > 0 {
            info!("Evicted {} idle conversations", evicted);
        }
        evicted
    }

    /// Periodically evict idle conversations
    ///
    /// The task ends on its own once the registry is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.evict_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.logs.iter().map(|entry| entry.key().clone()).collect()
    }
}
