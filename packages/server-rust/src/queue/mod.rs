//! Circuit-gated access to broker queues.
//!
//! - [`circuit`]: the process-wide enabled/disabled state machine
//! - [`registry`]: lazily opened per-queue handles, closed together whenever
//!   the circuit trips

pub mod circuit;
pub mod registry;

pub use circuit::{CircuitBreaker, CircuitState};
pub use registry::{QueueLease, QueueRegistry};
