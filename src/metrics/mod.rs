//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry,
};

/// Prometheus metrics for dispatch and compression
///
/// Each instance owns its registry so several relays (or tests) can coexist
/// in one process.
pub struct RelayMetrics {
    registry: Registry,

    // Dispatch metrics
    pub requests: CounterVec,
    pub request_duration: Histogram,
    pub admission_wait: Histogram,
    pub caller_runs: Counter,

    // Compression metrics
    pub compressions: CounterVec,
    pub messages_pruned: Counter,
}

impl RelayMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = register_counter_vec_with_registry!(
            Opts::new("relay_requests_total", "LLM requests by outcome"),
            &["outcome"],
            registry
        )?;

        let request_duration = register_histogram_with_registry!(
            HistogramOpts::new(
                "relay_request_duration_seconds",
                "Execution time of admitted requests in seconds"
            ),
            registry
        )?;

        let admission_wait = register_histogram_with_registry!(
            HistogramOpts::new(
                "relay_admission_wait_seconds",
                "Time spent waiting for an admission permit in seconds"
            ),
            registry
        )?;

        let caller_runs = register_counter_with_registry!(
            Opts::new(
                "relay_caller_runs_total",
                "Requests executed on the submitter because the pool was saturated"
            ),
            registry
        )?;

        let compressions = register_counter_vec_with_registry!(
            Opts::new("relay_compressions_total", "Context compressions by outcome"),
            &["outcome"],
            registry
        )?;

        let messages_pruned = register_counter_with_registry!(
            Opts::new(
                "relay_messages_pruned_total",
                "Messages removed from conversations by compression"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            admission_wait,
            caller_runs,
            compressions,
            messages_pruned,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a dispatched request
    pub fn record_request(&self, outcome: &str, duration_secs: Option<f64>) {
        self.requests.with_label_values(&[outcome]).inc();
        if let Some(secs) = duration_secs {
            self.request_duration.observe(secs);
        }
    }

    /// Record how long a request waited for admission
    pub fn record_admission_wait(&self, secs: f64) {
        self.admission_wait.observe(secs);
    }

    /// Record a compression run
    pub fn record_compression(&self, summarized: bool, removed: usize) {
        let outcome = if summarized { "summarized" } else { "pruned" };
        self.compressions.with_label_values(&[outcome]).inc();
        self.messages_pruned.inc_by(removed as f64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
