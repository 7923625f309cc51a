//! Per-conversation transcript with a cached character count

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::models::{Message, MessageMetadata};

/// Ordered message history for one conversation
///
/// Appends never wait on compression: the background task only holds the
/// write lock for the in-memory splice at the very end.
pub struct ConversationLog {
    id: String,
    session_id: Uuid,
    messages: RwLock<Vec<Message>>,
    budget: AtomicUsize,
    cached_chars: AtomicUsize,
    dirty: AtomicBool,
    compressing: AtomicBool,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

impl ConversationLog {
    pub fn new(id: impl Into<String>, budget: usize) -> Self {
        Self::with_history(id, budget, Vec::new())
    }

    /// Start a fresh session seeded with existing messages
    pub fn with_history(id: impl Into<String>, budget: usize, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: Uuid::new_v4(),
            messages: RwLock::new(messages),
            budget: AtomicUsize::new(budget),
            cached_chars: AtomicUsize::new(0),
            dirty: AtomicBool::new(true),
            compressing: AtomicBool::new(false),
            created_at: now,
            last_activity: RwLock::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .last_activity
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        let mut last = self
            .last_activity
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Utc::now();
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        self.messages
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the write lock; the cache is invalidated while it is held
    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        let guard = self
            .messages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.dirty.store(true, Ordering::SeqCst);
        guard
    }

    /// Append a message and return its id
    pub fn append(&self, message: Message) -> Uuid {
        let id = message.id;
        self.write().push(message);
        self.touch();
        id
    }

    pub fn append_user(&self, content: impl Into<String>) -> Uuid {
        self.append(Message::user(content))
    }

    pub fn append_assistant(&self, content: impl Into<String>) -> Uuid {
        self.append(Message::assistant(content))
    }

    pub fn append_system(&self, content: impl Into<String>) -> Uuid {
        self.append(Message::system(content))
    }

    /// Attach metadata to a message after the fact
    pub fn backfill_metadata(&self, message_id: Uuid, metadata: MessageMetadata) -> bool {
        let mut messages = self
            .messages
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.metadata = Some(metadata);
                true
            }
            None => false,
        }
    }

    /// Sum of message lengths in characters
    ///
    /// Served from the cache unless a mutation happened since the last read.
    pub fn total_characters(&self) -> usize {
        if !self.dirty.load(Ordering::SeqCst) {
            return self.cached_chars.load(Ordering::SeqCst);
        }

        // Writers need the write lock to set `dirty`, so storing the result
        // under the read lock cannot hide a concurrent append.
        let messages = self.read();
        let total = messages.iter().map(Message::char_len).sum();
        self.cached_chars.store(total, Ordering::SeqCst);
        self.dirty.store(false, Ordering::SeqCst);
        total
    }

    /// Takes effect at the next budget evaluation
    pub fn set_budget(&self, budget: usize) {
        self.budget.store(budget, Ordering::SeqCst);
    }

    pub fn budget(&self) -> usize {
        self.budget.load(Ordering::SeqCst)
    }

    pub fn is_over_budget(&self) -> bool {
        self.total_characters() > self.budget()
    }

    /// Snapshot of the current history
    pub fn messages(&self) -> Vec<Message> {
        self.read().clone()
    }

    /// The last `count` messages, oldest first
    pub fn recent_messages(&self, count: usize) -> Vec<Message> {
        let messages = self.read();
        let start = messages.len().saturating_sub(count);
        messages[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
        self.touch();
    }

    /// True when nothing has been appended for longer than `idle`
    pub fn is_expired(&self, idle: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.last_activity())
            .to_std()
            .map_or(false, |elapsed| elapsed > idle)
    }

    pub fn compression_in_progress(&self) -> bool {
        self.compressing.load(Ordering::SeqCst)
    }

    /// Claim the single compression slot for this log
    ///
    /// Returns `None` when another compression already holds it. The slot is
    /// released when the returned guard is dropped.
    pub fn try_begin_compression(self: &Arc<Self>) -> Option<CompressionGuard> {
        self.compressing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CompressionGuard { log: self.clone() })
    }

    /// Swap the given messages for a single summary
    ///
    /// The summary takes the position of the first replaced message, so
    /// anything appended while the summarizer ran stays after it. Returns the
    /// number of messages removed; when none of them is left (the log was
    /// cleared meanwhile) the summary is discarded.
    pub fn replace_with_summary(&self, replaced: &[Uuid], summary: Message) -> usize {
        let mut messages = self.write();
        let Some(position) = messages.iter().position(|m| replaced.contains(&m.id)) else {
            return 0;
        };
        let before = messages.len();
        messages.retain(|m| !replaced.contains(&m.id));
        let removed = before - messages.len();

        let len = messages.len();
        messages.insert(position.min(len), summary);
        removed
    }

    /// Delete the oldest unpinned message
    ///
    /// Refuses once a single unpinned message is left, so the most recent
    /// message is never lost.
    pub fn remove_oldest_unpinned(&self) -> Option<Message> {
        let mut messages = self.write();
        let unpinned = messages.iter().filter(|m| !m.is_pinned()).count();
        if unpinned <= 1 {
            return None;
        }
        let index = messages.iter().position(|m| !m.is_pinned())?;
        let removed = messages.remove(index);
        debug!(
            conversation_id = %self.id,
            message_id = %removed.id,
            "Pruned oldest message"
        );
        Some(removed)
    }
}

/// Holds the per-log compression slot
pub struct CompressionGuard {
    log: Arc<ConversationLog>,
}

impl CompressionGuard {
    pub fn log(&self) -> &Arc<ConversationLog> {
        &self.log
    }
}

impl Drop for CompressionGuard {
    fn drop(&mut self) {
        self.log.compressing.store(false, Ordering::SeqCst);
    }
}
