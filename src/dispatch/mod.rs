//! Admission-controlled request dispatch
//!
//! Bounds the number of in-flight LLM calls with a FIFO permit gate, runs
//! work on a bounded worker pool and keeps request/token accounting.

pub mod admission;
pub mod dispatcher;
pub mod usage;

pub use admission::{AdmissionError, AdmissionGate, AdmissionPermit, QueuedMark};
pub use dispatcher::{CarriesUsage, DispatchError, RequestDispatcher, RequestHandle};
pub use usage::{PoolStats, StatsSnapshot, TokenUsage, UsageCounters};
