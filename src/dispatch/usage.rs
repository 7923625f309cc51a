//! Request and token accounting

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Token usage reported by the provider for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Lock-free counters shared by the gate and the dispatcher
///
/// `queued` and `active` are gauges and move both ways; everything else is
/// monotonic.
#[derive(Debug, Default)]
pub struct UsageCounters {
    active: AtomicI64,
    queued: AtomicI64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl UsageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_queued(&self) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unmark_queued(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unmark_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Add provider-reported usage; zero fields are ignored
    pub fn record_tokens(&self, usage: TokenUsage) {
        if usage.prompt_tokens > 0 {
            self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        }
        if usage.completion_tokens > 0 {
            self.completion_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }
        if usage.total_tokens > 0 {
            self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Snapshot the counters; pool figures are filled in by the dispatcher
    pub fn snapshot(&self, pool: PoolStats) -> StatsSnapshot {
        StatsSnapshot {
            active_requests: self.active(),
            queued_requests: self.queued(),
            total_requests: self.total(),
            completed_requests: self.completed(),
            failed_requests: self.failed(),
            pool_size: pool.pool_size,
            active_threads: pool.active_threads,
            queue_size: pool.queue_size,
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool occupancy at snapshot time
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub pool_size: usize,
    pub active_threads: usize,
    pub queue_size: usize,
}

/// Point-in-time view of dispatcher activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub active_requests: usize,
    pub queued_requests: usize,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub pool_size: usize,
    pub active_threads: usize,
    pub queue_size: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        ratio(self.completed_requests, self.total_requests)
    }

    pub fn failure_rate(&self) -> f64 {
        ratio(self.failed_requests, self.total_requests)
    }

    pub fn average_prompt_tokens(&self) -> f64 {
        ratio(self.prompt_tokens, self.completed_requests)
    }

    pub fn average_completion_tokens(&self) -> f64 {
        ratio(self.completion_tokens, self.completed_requests)
    }

    pub fn average_total_tokens(&self) -> f64 {
        ratio(self.total_tokens, self.completed_requests)
    }

    /// Completion tokens produced per prompt token
    pub fn token_efficiency(&self) -> f64 {
        ratio(self.completion_tokens, self.prompt_tokens)
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
