//! Waybill Core: job kinds, payloads, idempotency keys, dead-letter envelopes,
//! and error classification.
//!
//! Everything in this crate is pure and I/O-free. The orchestration layer in
//! `waybill-server` builds on these types to talk to the queue broker.

pub mod classify;
pub mod envelope;
pub mod idempotency;
pub mod payload;
pub mod types;

pub use classify::{classify, classify_error, ErrorClass};
pub use envelope::{DeadLetterEnvelope, EnvelopeError, FailedAt, KnownQueues};
pub use idempotency::{canonicalize, idempotency_key};
pub use payload::{Coordinates, GeocodePayload, RouteRequest};
pub use types::{JobHandle, JobKind, JobRequest, JobSnapshot, JobState, Outcome, UnknownJobKind};
