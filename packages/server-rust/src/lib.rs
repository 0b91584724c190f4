//! Waybill Server: circuit-gated job queues with idempotent dispatch, result
//! waiting with synchronous fallback, dead-letter recovery, and an operator
//! HTTP surface.

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod job_metrics;
pub mod network;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod waiter;

pub use broker::{Broker, BrokerError, ConnectionEvent, MemoryBroker, QueueBackend, QueueEvents};
pub use config::{ConfigError, QueueConfig};
pub use dispatch::{DispatchError, Dispatcher, RouteOptions, Submission};
pub use job_metrics::JobMetrics;
pub use orchestrator::Orchestrator;
pub use queue::{CircuitBreaker, CircuitState, QueueLease, QueueRegistry};
pub use recovery::{DiagnosticsReport, RecoveryOptions, RecoveryReport, RecoveryService};
pub use waiter::ResultWaiter;

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
