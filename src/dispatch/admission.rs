//! Admission gate bounding in-flight LLM calls

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::usage::UsageCounters;

/// Why a permit could not be obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("no admission permit within {0:?}")]
    Timeout(Duration),

    #[error("admission gate closed")]
    Closed,
}

/// Counting permit pool, independent of worker pool sizing
///
/// Waiters are served first-come-first-served, so sustained load cannot
/// starve an early waiter.
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
    counters: Arc<UsageCounters>,
}

impl AdmissionGate {
    pub fn new(ceiling: usize, counters: Arc<UsageCounters>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            counters,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn has_capacity(&self) -> bool {
        self.available() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Take a permit only if one is free right now
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit::new(permit, self.counters.clone()))
    }

    /// Wait up to `timeout` for a permit
    ///
    /// `queued` is the request's entry in the queued gauge. It is cleared
    /// exactly once, including when the waiting future is dropped.
    pub async fn admit(
        &self,
        timeout: Duration,
        mut queued: QueuedMark,
    ) -> Result<AdmissionPermit, AdmissionError> {
        if let Some(permit) = self.try_admit() {
            return Ok(permit);
        }

        if self.semaphore.is_closed() {
            return Err(AdmissionError::Closed);
        }

        queued.arm();
        let outcome = tokio::time::timeout(timeout, self.semaphore.clone().acquire_owned()).await;
        drop(queued);

        match outcome {
            Ok(Ok(permit)) => Ok(AdmissionPermit::new(permit, self.counters.clone())),
            Ok(Err(_)) => Err(AdmissionError::Closed),
            Err(_) => {
                debug!("Admission wait timed out after {:?}", timeout);
                Err(AdmissionError::Timeout(timeout))
            }
        }
    }

    /// An unarmed queued mark for this gate's counters
    pub fn queued_mark(&self) -> QueuedMark {
        QueuedMark::new(self.counters.clone(), false)
    }

    /// Wake every waiter with `Closed` and refuse new admissions
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// One request's entry in the queued gauge
///
/// Armed at submission when no permit is free, so observers see the request
/// as queued before a worker picks it up. Cleared on drop.
pub struct QueuedMark {
    counters: Arc<UsageCounters>,
    armed: bool,
}

impl QueuedMark {
    pub fn new(counters: Arc<UsageCounters>, armed: bool) -> Self {
        if armed {
            counters.mark_queued();
        }
        Self { counters, armed }
    }

    fn arm(&mut self) {
        if !self.armed {
            self.counters.mark_queued();
            self.armed = true;
        }
    }
}

impl Drop for QueuedMark {
    fn drop(&mut self) {
        if self.armed {
            self.counters.unmark_queued();
        }
    }
}

/// A held admission permit; counts as one active request until dropped
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<UsageCounters>,
}

impl AdmissionPermit {
    fn new(permit: OwnedSemaphorePermit, counters: Arc<UsageCounters>) -> Self {
        counters.mark_active();
        Self {
            _permit: permit,
            counters,
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.counters.unmark_active();
    }
}
