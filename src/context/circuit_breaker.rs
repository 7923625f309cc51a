//! Circuit breaker guarding summarizer calls

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::CompressionConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Reset timeout elapsed; one trial call is let through
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: usize,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&CompressionConfig> for CircuitBreakerConfig {
    fn from(config: &CompressionConfig) -> Self {
        Self {
            failure_threshold: config.circuit_breaker_failures.max(1),
            reset_timeout: config.breaker_reset_timeout(),
        }
    }
}

/// Per-operation breakers, keyed by a caller-chosen name (e.g. the model)
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether calls for `operation` should be skipped right now
    ///
    /// While half-open, only the caller that claims the trial sees `false`
    /// until that trial is reported through `mark_success` or `mark_failure`.
    pub fn is_open(&self, operation: &str) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(operation) else {
            return false;
        };

        match (entry.state, entry.opened_at) {
            (BreakerState::Open, Some(opened_at))
                if opened_at.elapsed() >= self.config.reset_timeout =>
            {
                info!(operation, "Circuit breaker half-open, allowing a trial call");
                entry.state = BreakerState::HalfOpen;
                entry.trial_in_flight = true;
                false
            }
            (BreakerState::Open, _) => true,
            (BreakerState::HalfOpen, _) => {
                let skip = entry.trial_in_flight;
                entry.trial_in_flight = true;
                skip
            }
            (BreakerState::Closed, _) => false,
        }
    }

    pub fn mark_success(&self, operation: &str) {
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(operation) {
            if entry.state != BreakerState::Closed {
                info!(operation, "Circuit breaker closed");
            }
            *entry = BreakerEntry::default();
        }
    }

    pub fn mark_failure(&self, operation: &str) {
        let mut entries = self.entries();
        let entry = entries.entry(operation.to_string()).or_default();

        entry.consecutive_failures += 1;
        entry.last_failure = Some(Instant::now());

        // A failed trial reopens immediately.
        let trip = entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold;
        if trip && entry.state != BreakerState::Open {
            warn!(
                operation,
                failures = entry.consecutive_failures,
                "Circuit breaker opened"
            );
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
        entry.trial_in_flight = false;
    }

    pub fn state(&self, operation: &str) -> BreakerState {
        self.entries()
            .get(operation)
            .map_or(BreakerState::Closed, |e| e.state)
    }

    pub fn stats(&self, operation: &str) -> BreakerStats {
        let entries = self.entries();
        let entry = entries.get(operation).cloned().unwrap_or_default();
        BreakerStats {
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            last_failure: entry.last_failure,
        }
    }

    pub fn reset(&self, operation: &str) {
        self.entries().remove(operation);
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: usize,
    pub last_failure: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: usize, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: reset,
        })
    }

    #[test]
    fn test_closed_by_default() {
        let breaker = CircuitBreaker::default();
        assert!(!breaker.is_open("summarize"));
        assert_eq!(breaker.state("summarize"), BreakerState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(3, Duration::from_secs(30));

        breaker.mark_failure("summarize");
        breaker.mark_failure("summarize");
        assert!(!breaker.is_open("summarize"));

        breaker.mark_failure("summarize");
        assert!(breaker.is_open("summarize"));
        assert_eq!(breaker.stats("summarize").consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = breaker(3, Duration::from_secs(30));
        breaker.mark_failure("summarize");
        breaker.mark_failure("summarize");
        breaker.mark_success("summarize");

        let stats = breaker.stats("summarize");
        assert_eq!(stats.state, BreakerState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.last_failure.is_none());
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let breaker = breaker(2, Duration::from_millis(50));
        breaker.mark_failure("summarize");
        breaker.mark_failure("summarize");
        assert!(breaker.is_open("summarize"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!breaker.is_open("summarize"));
        assert_eq!(breaker.state("summarize"), BreakerState::HalfOpen);

        breaker.mark_failure("summarize");
        assert!(breaker.is_open("summarize"));
    }

    #[test]
    fn test_half_open_admits_a_single_trial() {
        let breaker = breaker(1, Duration::from_millis(30));
        breaker.mark_failure("summarize");
        std::thread::sleep(Duration::from_millis(50));

        assert!(!breaker.is_open("summarize"));
        // Concurrent callers are held back while the trial runs.
        assert!(breaker.is_open("summarize"));
        assert!(breaker.is_open("summarize"));

        breaker.mark_success("summarize");
        assert!(!breaker.is_open("summarize"));
        assert!(!breaker.is_open("summarize"));
        assert_eq!(breaker.state("summarize"), BreakerState::Closed);
    }

    #[test]
    fn test_operations_are_independent() {
        let breaker = breaker(1, Duration::from_secs(30));
        breaker.mark_failure("model-a");
        assert!(breaker.is_open("model-a"));
        assert!(!breaker.is_open("model-b"));

        breaker.reset("model-a");
        assert!(!breaker.is_open("model-a"));
    }

    #[test]
    fn test_config_from_compression_settings() {
        let config = CircuitBreakerConfig::from(&CompressionConfig::default());
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }
}
