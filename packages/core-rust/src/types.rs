use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of background job the orchestration layer knows how to dispatch.
///
/// The wire name (the job "name" stored by the broker) is the variant name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Resolve a free-form address into coordinates.
    GeocodeAddress,
    /// Compute the driving distance between two coordinates.
    RouteDistance,
}

impl JobKind {
    /// Name under which the broker stores jobs of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GeocodeAddress => "GeocodeAddress",
            Self::RouteDistance => "RouteDistance",
        }
    }

    /// Fixed prefix mixed into idempotency keys, so equal payloads of
    /// different kinds never collide.
    #[must_use]
    pub fn idempotency_prefix(self) -> &'static str {
        match self {
            Self::GeocodeAddress => "geocode",
            Self::RouteDistance => "route-distance",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a job name does not match any [`JobKind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GeocodeAddress" => Ok(Self::GeocodeAddress),
            "RouteDistance" => Ok(Self::RouteDistance),
            other => Err(UnknownJobKind(other.to_string())),
        }
    }
}

/// Broker-side lifecycle state of a job.
///
/// `Waiting -> Active -> {Completed | Failed}`. `Delayed` holds jobs sitting
/// out a backoff interval between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outcome label recorded by the result waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Completed,
    Failed,
    Timeout,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

/// Broker-assigned view of a submitted job.
///
/// Owned by the broker; the orchestration layer only observes it. All
/// timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
    /// Job name as stored by the broker. Usually a [`JobKind`] wire name, but
    /// dead-letter entries may carry arbitrary names.
    pub name: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub enqueued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub failure_reason: Option<String>,
}

impl JobHandle {
    /// The job's kind, when its name is one this crate knows.
    #[must_use]
    pub fn kind(&self) -> Option<JobKind> {
        self.name.parse().ok()
    }

    /// Broker-side processing time, when both stamps are known.
    #[must_use]
    pub fn processing_millis(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(finish)) if finish >= start => Some(finish - start),
            _ => None,
        }
    }
}

/// A job as the dispatcher is about to submit it. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub queue: String,
    pub kind: JobKind,
    pub payload: Value,
    /// Used as the broker job id, so equal requests collapse onto one job.
    pub idempotency_key: String,
}

impl JobRequest {
    /// Builds a request whose idempotency key covers the whole payload.
    #[must_use]
    pub fn new(queue: impl Into<String>, kind: JobKind, payload: Value) -> Self {
        let idempotency_key = crate::idempotency::idempotency_key(kind, &payload);
        Self {
            queue: queue.into(),
            kind,
            payload,
            idempotency_key,
        }
    }
}

/// A job together with its payload and (if completed) its return value.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub handle: JobHandle,
    pub data: Value,
    pub return_value: Option<Value>,
}
