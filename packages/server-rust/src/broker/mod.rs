//! Queue broker seam.
//!
//! The broker is an external at-least-once job store with retry/backoff and
//! completion notifications. This module defines the three handles the
//! orchestration layer talks to:
//!
//! - [`Broker`]: one connection pool; opens per-queue handles and publishes
//!   pool-level [`ConnectionEvent`]s.
//! - [`QueueBackend`]: add, inspect, retry and remove jobs on one queue.
//! - [`QueueEvents`]: completion subscription for one queue.
//!
//! [`MemoryBroker`] is the in-process implementation used by tests and local
//! development (`memory://` URLs). Production adapters implement the same
//! traits.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use waybill_core::{JobHandle, JobSnapshot, JobState};

pub use memory::MemoryBroker;

// ---------------------------------------------------------------------------
// Job options
// ---------------------------------------------------------------------------

/// Exponential backoff between attempts: `base_delay_ms * 2^(attempt - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay_ms: u64,
}

impl Backoff {
    /// Delay before retrying after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.base_delay_ms.saturating_mul(1u64 << exponent)
    }
}

/// Options attached to every submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts before the job is marked failed.
    pub attempts: u32,
    pub backoff: Backoff,
    /// How many completed jobs the broker keeps per queue.
    pub remove_on_complete: usize,
    /// How many failed jobs the broker keeps per queue.
    pub remove_on_fail: usize,
}

/// A job to be added to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Caller-chosen job id. Adding a job whose id already exists is a no-op
    /// that returns the existing job.
    pub id: String,
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
}

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

/// Errors reported by broker handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("Connection is closed")]
    Closed,
    #[error("job {id} not found")]
    NotFound { id: String },
    #[error("job {id} failed: {reason}")]
    JobFailed { id: String, reason: String },
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("unsupported broker url: {url}")]
    UnsupportedUrl { url: String },
}

/// Pool-level connection signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection (re)established and is ready for commands.
    Ready,
    /// The connection failed or dropped.
    Error(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Handle to a single named queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves once the handle's connection can serve commands.
    async fn wait_until_ready(&self) -> Result<(), BrokerError>;

    async fn add(&self, job: NewJob) -> Result<JobHandle, BrokerError>;

    async fn get_job(&self, id: &str) -> Result<Option<JobSnapshot>, BrokerError>;

    /// Up to `limit` jobs in `state`, oldest first.
    async fn jobs(&self, state: JobState, limit: usize) -> Result<Vec<JobSnapshot>, BrokerError>;

    /// Moves a failed job back to waiting.
    async fn retry(&self, id: &str) -> Result<(), BrokerError>;

    async fn remove(&self, id: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Completion subscription for a single named queue.
#[async_trait]
pub trait QueueEvents: Send + Sync {
    async fn wait_until_ready(&self) -> Result<(), BrokerError>;

    /// Resolves with the job's return value once it completes.
    ///
    /// Fails with [`BrokerError::JobFailed`] when the job ends up failed and
    /// with [`BrokerError::Closed`] when this handle is closed while waiting.
    async fn wait_until_finished(&self, id: &str) -> Result<Value, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A broker connection pool shared by every queue.
pub trait Broker: Send + Sync {
    fn open_queue(&self, name: &str) -> Arc<dyn QueueBackend>;

    fn open_events(&self, name: &str) -> Arc<dyn QueueEvents>;

    /// Subscribes to pool-level connection signals.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Resolves a broker connection descriptor.
///
/// # Errors
///
/// Returns [`BrokerError::UnsupportedUrl`] for schemes without a built-in
/// adapter. Only `memory://` is built in.
pub fn connect(url: &str) -> Result<Arc<dyn Broker>, BrokerError> {
    if url.starts_with("memory://") {
        Ok(Arc::new(MemoryBroker::new()))
    } else {
        Err(BrokerError::UnsupportedUrl {
            url: url.to_string(),
        })
    }
}
