//! Request dispatcher: bounded worker pool behind an admission gate
//!
//! Work is handed to a fixed set of core workers through a bounded queue.
//! When the queue is full, a surplus worker (up to `max_pool_size`) takes the
//! job directly; when the pool is saturated too, the job runs on the task that
//! awaits its handle instead of being rejected. A handle dropped before its
//! work finished hands the job to the runtime, so submitted work always runs
//! unless it is cancelled.

use futures::future::{AbortHandle, Aborted, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionError, AdmissionGate, QueuedMark};
use super::usage::{PoolStats, StatsSnapshot, TokenUsage, UsageCounters};
use crate::config::DispatcherConfig;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;

type Job = BoxFuture<'static, ()>;

/// Dispatch failures, delivered through the request handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("request {request_id} timed out after {waited:?} waiting for an admission permit")]
    Timeout { request_id: String, waited: Duration },

    #[error("request {request_id} failed: {cause}")]
    ExecutionFailed { request_id: String, cause: String },

    #[error("request {request_id} rejected: worker pool saturated")]
    Rejected { request_id: String },

    #[error("request {request_id} refused: dispatcher is shut down")]
    ShutDown { request_id: String },

    #[error("request {request_id} was cancelled before completing")]
    Cancelled { request_id: String },
}

impl DispatchError {
    pub fn request_id(&self) -> &str {
        match self {
            DispatchError::Timeout { request_id, .. }
            | DispatchError::ExecutionFailed { request_id, .. }
            | DispatchError::Rejected { request_id }
            | DispatchError::ShutDown { request_id }
            | DispatchError::Cancelled { request_id } => request_id,
        }
    }
}

/// Results that may carry provider token usage
pub trait CarriesUsage {
    fn token_usage(&self) -> Option<TokenUsage> {
        None
    }
}

impl CarriesUsage for TokenUsage {
    fn token_usage(&self) -> Option<TokenUsage> {
        Some(*self)
    }
}

impl<T: CarriesUsage> CarriesUsage for Option<T> {
    fn token_usage(&self) -> Option<TokenUsage> {
        self.as_ref().and_then(CarriesUsage::token_usage)
    }
}

macro_rules! no_usage {
    ($($ty:ty),*) => {
        $(impl CarriesUsage for $ty {})*
    };
}

no_usage!((), bool, String, u32, u64, usize, i32, i64);

/// Future resolving to the outcome of a submitted request
pub struct RequestHandle<T> {
    request_id: String,
    state: HandleState<T>,
    abort: Option<AbortHandle>,
}

enum HandleState<T> {
    Dispatched(oneshot::Receiver<std::result::Result<T, DispatchError>>),
    CallerRuns {
        job: Option<Job>,
        rx: oneshot::Receiver<std::result::Result<T, DispatchError>>,
        runtime: Handle,
    },
    Ready(Option<std::result::Result<T, DispatchError>>),
}

// `T` is only ever moved out of a oneshot or an Option, never pinned.
impl<T> Unpin for RequestHandle<T> {}

impl<T> RequestHandle<T> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// True when the work will execute on the awaiting task
    pub fn runs_on_caller(&self) -> bool {
        matches!(self.state, HandleState::CallerRuns { .. })
    }

    /// Abandon the request
    ///
    /// Work that has not finished yet stops at its next await point, counts
    /// as failed and resolves to `Cancelled`. Finished work is unaffected.
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    fn ready(request_id: String, result: std::result::Result<T, DispatchError>) -> Self {
        Self {
            request_id,
            state: HandleState::Ready(Some(result)),
            abort: None,
        }
    }
}

impl<T> Drop for RequestHandle<T> {
    fn drop(&mut self) {
        if let HandleState::CallerRuns { job, runtime, .. } = &mut self.state {
            if let Some(job) = job.take() {
                debug!(
                    request_id = %self.request_id,
                    "Handle dropped before its work finished, continuing on the runtime"
                );
                runtime.spawn(job);
            }
        }
    }
}

impl<T> Future for RequestHandle<T> {
    type Output = std::result::Result<T, DispatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let request_id = &this.request_id;

        let rx = match &mut this.state {
            HandleState::Dispatched(rx) => rx,
            HandleState::CallerRuns { job, rx, .. } => {
                if let Some(running) = job {
                    if running.as_mut().poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    *job = None;
                }
                rx
            }
            HandleState::Ready(slot) => {
                return Poll::Ready(slot.take().unwrap_or_else(|| {
                    Err(DispatchError::Cancelled {
                        request_id: request_id.clone(),
                    })
                }));
            }
        };

        Pin::new(rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(DispatchError::Cancelled {
                    request_id: request_id.clone(),
                })
            })
        })
    }
}

struct Inner {
    config: DispatcherConfig,
    gate: AdmissionGate,
    counters: Arc<UsageCounters>,
    metrics: Option<Arc<RelayMetrics>>,
    runtime: Handle,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pool_size: AtomicUsize,
    busy_workers: AtomicUsize,
    queue_len: AtomicUsize,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Admission-controlled dispatcher for LLM calls
///
/// Cheap to clone; clones share the same pool, gate and counters.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl RequestDispatcher {
    /// Start the core workers on the current tokio runtime
    pub fn new(config: DispatcherConfig, metrics: Option<Arc<RelayMetrics>>) -> Result<Self> {
        config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|e| RelayError::Internal(format!("dispatcher needs a tokio runtime: {}", e)))?;

        let counters = Arc::new(UsageCounters::new());
        let gate = AdmissionGate::new(config.max_concurrent_requests, counters.clone());
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let inner = Arc::new(Inner {
            gate,
            counters,
            metrics,
            runtime,
            sender: Mutex::new(Some(tx)),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            pool_size: AtomicUsize::new(config.core_pool_size),
            busy_workers: AtomicUsize::new(0),
            queue_len: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            config,
        });

        {
            let mut workers = lock(&inner.workers);
            for _ in 0..inner.config.core_pool_size {
                let worker = inner.runtime.spawn(worker_loop(inner.clone(), None, None));
                workers.push(worker);
            }
        }

        info!(
            max_concurrent = inner.config.max_concurrent_requests,
            queue_capacity = inner.config.queue_capacity,
            core_pool_size = inner.config.core_pool_size,
            max_pool_size = inner.config.max_pool_size,
            "Request dispatcher initialized"
        );

        Ok(Self { inner })
    }

    /// Submit a unit of work; never blocks
    pub fn submit<T, F, Fut>(&self, work: F, request_id: impl Into<String>) -> RequestHandle<T>
    where
        T: CarriesUsage + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let request_id = request_id.into();
        let inner = &self.inner;

        let sender = match lock(&inner.sender).as_ref() {
            Some(sender) if !inner.shut_down.load(Ordering::SeqCst) => sender.clone(),
            _ => {
                debug!(request_id = %request_id, "Submission refused after shutdown");
                let error = DispatchError::ShutDown {
                    request_id: request_id.clone(),
                };
                return RequestHandle::ready(request_id, Err(error));
            }
        };

        inner.counters.record_submitted();

        // Observers see the request as queued before any worker picks it up.
        let at_capacity = !inner.gate.has_capacity();
        if at_capacity {
            debug!(request_id = %request_id, "Request queued due to concurrency limit");
        }
        let mark = QueuedMark::new(inner.counters.clone(), at_capacity);

        let (tx, rx) = oneshot::channel();
        let (work, abort) =
            futures::future::abortable(execute(inner.clone(), request_id.clone(), work, mark));
        let job: Job = {
            let inner = inner.clone();
            let request_id = request_id.clone();
            Box::pin(async move {
                let result = match work.await {
                    Ok(result) => result,
                    Err(Aborted) => {
                        debug!(request_id = %request_id, "Request cancelled");
                        inner.counters.record_failed();
                        if let Some(metrics) = &inner.metrics {
                            metrics.record_request("cancelled", None);
                        }
                        Err(DispatchError::Cancelled { request_id })
                    }
                };
                let _ = tx.send(result);
            })
        };

        inner.queue_len.fetch_add(1, Ordering::SeqCst);
        let job = match sender.try_send(job) {
            Ok(()) => {
                return RequestHandle {
                    request_id,
                    state: HandleState::Dispatched(rx),
                    abort: Some(abort),
                };
            }
            Err(mpsc::error::TrySendError::Full(job)) | Err(mpsc::error::TrySendError::Closed(job)) => {
                inner.queue_len.fetch_sub(1, Ordering::SeqCst);
                job
            }
        };

        if self.reserve_surplus_slot() {
            self.spawn_surplus(job);
            return RequestHandle {
                request_id,
                state: HandleState::Dispatched(rx),
                abort: Some(abort),
            };
        }

        if !inner.config.caller_runs_on_saturation {
            warn!(request_id = %request_id, "Request rejected: worker pool saturated");
            drop(job);
            inner.counters.record_failed();
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("rejected", None);
            }
            let error = DispatchError::Rejected {
                request_id: request_id.clone(),
            };
            return RequestHandle::ready(request_id, Err(error));
        }

        debug!(request_id = %request_id, "Worker pool saturated, running on caller");
        if let Some(metrics) = &inner.metrics {
            metrics.caller_runs.inc();
        }
        RequestHandle {
            request_id,
            state: HandleState::CallerRuns {
                job: Some(job),
                rx,
                runtime: inner.runtime.clone(),
            },
            abort: Some(abort),
        }
    }

    /// Reserve a surplus worker slot if the pool may still grow
    fn reserve_surplus_slot(&self) -> bool {
        let max = self.inner.config.max_pool_size;
        self.inner
            .pool_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size < max).then_some(size + 1)
            })
            .is_ok()
    }

    fn spawn_surplus(&self, job: Job) {
        let inner = self.inner.clone();
        let keep_alive = inner.config.keep_alive();
        let worker = inner
            .runtime
            .spawn(worker_loop(inner.clone(), Some(job), Some(keep_alive)));
        lock(&self.inner.workers).push(worker);
        debug!(
            pool_size = self.inner.pool_size.load(Ordering::SeqCst),
            "Spawned surplus worker"
        );
    }

    /// Liveness check for external probes; not used for gating
    pub fn is_healthy(&self) -> bool {
        let inner = &self.inner;
        let queue_len = inner.queue_len.load(Ordering::SeqCst) as f64;
        !inner.shut_down.load(Ordering::SeqCst)
            && inner.counters.active() <= inner.gate.ceiling()
            && queue_len < inner.config.queue_capacity as f64 * 0.9
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Snapshot counters and pool occupancy without blocking
    pub fn stats(&self) -> StatsSnapshot {
        let inner = &self.inner;
        inner.counters.snapshot(PoolStats {
            pool_size: inner.pool_size.load(Ordering::SeqCst),
            active_threads: inner.busy_workers.load(Ordering::SeqCst),
            queue_size: inner.queue_len.load(Ordering::SeqCst),
        })
    }

    pub fn counters(&self) -> &Arc<UsageCounters> {
        &self.inner.counters
    }

    pub fn ceiling(&self) -> usize {
        self.inner.gate.ceiling()
    }

    /// Stop accepting work, drain within the grace period, then abort
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Shutting down request dispatcher");

        // Dropping the sender lets workers drain the queue and then exit.
        lock(&inner.sender).take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&inner.workers));
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let grace = inner.config.shutdown_grace();

        match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
            Ok(_) => info!("Request dispatcher drained"),
            Err(_) => {
                warn!("Dispatcher did not drain within {:?}, aborting remaining work", grace);
                inner.gate.close();
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

async fn worker_loop(inner: Arc<Inner>, first: Option<Job>, keep_alive: Option<Duration>) {
    if let Some(job) = first {
        run_job(&inner, job).await;
    }

    loop {
        let receiver = inner.receiver.clone();
        let next = async move { receiver.lock().await.recv().await };

        let job = match keep_alive {
            Some(idle) => match tokio::time::timeout(idle, next).await {
                Ok(job) => job,
                Err(_) => {
                    debug!("Surplus worker idle for {:?}, retiring", idle);
                    None
                }
            },
            None => next.await,
        };

        match job {
            Some(job) => {
                inner.queue_len.fetch_sub(1, Ordering::SeqCst);
                run_job(&inner, job).await;
            }
            None => break,
        }
    }

    inner.pool_size.fetch_sub(1, Ordering::SeqCst);
}

async fn run_job(inner: &Inner, job: Job) {
    inner.busy_workers.fetch_add(1, Ordering::SeqCst);
    job.await;
    inner.busy_workers.fetch_sub(1, Ordering::SeqCst);
}

/// Admit, run and account for one unit of work
async fn execute<T, F, Fut>(
    inner: Arc<Inner>,
    request_id: String,
    work: F,
    mark: QueuedMark,
) -> std::result::Result<T, DispatchError>
where
    T: CarriesUsage + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let wait_started = Instant::now();

    let permit = match inner
        .gate
        .admit(inner.config.request_timeout(), mark)
        .await
    {
        Ok(permit) => permit,
        Err(AdmissionError::Timeout(waited)) => {
            warn!(request_id = %request_id, "Request timed out waiting for a concurrency slot");
            inner.counters.record_failed();
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("timeout", None);
            }
            return Err(DispatchError::Timeout { request_id, waited });
        }
        Err(AdmissionError::Closed) => {
            inner.counters.record_failed();
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("shutdown", None);
            }
            return Err(DispatchError::ShutDown { request_id });
        }
    };

    if let Some(metrics) = &inner.metrics {
        metrics.record_admission_wait(wait_started.elapsed().as_secs_f64());
    }

    debug!(
        request_id = %request_id,
        active = inner.counters.active(),
        ceiling = inner.gate.ceiling(),
        "Starting LLM request"
    );

    let started = Instant::now();
    let outcome = AssertUnwindSafe(async move { work().await })
        .catch_unwind()
        .await;
    let elapsed = started.elapsed();

    let result = match outcome {
        Ok(Ok(value)) => {
            inner.counters.record_completed();
            if let Some(usage) = value.token_usage() {
                inner.counters.record_tokens(usage);
            }
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("completed", Some(elapsed.as_secs_f64()));
            }
            debug!(
                request_id = %request_id,
                duration_ms = elapsed.as_millis() as u64,
                queued = inner.counters.queued(),
                "LLM request completed"
            );
            Ok(value)
        }
        Ok(Err(err)) => {
            inner.counters.record_failed();
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("failed", Some(elapsed.as_secs_f64()));
            }
            error!(request_id = %request_id, "LLM request failed: {:#}", err);
            Err(DispatchError::ExecutionFailed {
                request_id,
                cause: format!("{:#}", err),
            })
        }
        Err(panic) => {
            inner.counters.record_failed();
            if let Some(metrics) = &inner.metrics {
                metrics.record_request("failed", Some(elapsed.as_secs_f64()));
            }
            let cause = panic_message(panic);
            error!(request_id = %request_id, "LLM request panicked: {}", cause);
            Err(DispatchError::ExecutionFailed {
                request_id,
                cause: format!("work panicked: {}", cause),
            })
        }
    };

    drop(permit);
    result
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
