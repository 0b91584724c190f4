//! Dead-letter envelopes and their validation.
//!
//! Worker processes wrap a job that exhausted its retries into an envelope
//! and push it onto the dead-letter queue. Only well-formed envelopes may be
//! replayed back onto their origin queue.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The queues the orchestration layer owns.
///
/// `primary` is the set of valid replay origins. The dead-letter queue is
/// deliberately not a member of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownQueues {
    pub primary: Vec<String>,
    pub dead_letter: String,
}

impl KnownQueues {
    #[must_use]
    pub fn is_replay_origin(&self, queue: &str) -> bool {
        queue != self.dead_letter && self.primary.iter().any(|q| q == queue)
    }
}

/// Payload of a dead-letter queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    /// Queue the job originally ran on.
    pub queue: String,
    /// Job name (kind) the job originally ran under.
    pub name: String,
    /// Original job payload.
    pub data: Value,
    #[serde(default, deserialize_with = "lenient")]
    pub failed_reason: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub attempts_made: u32,
    #[serde(default, deserialize_with = "lenient")]
    pub failed_at: Option<FailedAt>,
}

/// Failure timestamp as written by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailedAt {
    /// Milliseconds since the Unix epoch.
    Millis(u64),
    /// Date string, usually RFC 3339.
    Text(String),
}

/// Diagnostic metadata never decides whether an entry is replayable: a value
/// of the wrong type reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Why a dead-letter entry is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid dead-letter payload: {0}")]
    Shape(String),
    #[error("invalid dead-letter payload: origin queue {queue:?} is the dead-letter queue")]
    SelfReferential { queue: String },
    #[error("invalid dead-letter payload: unknown origin queue {queue:?}")]
    UnknownOrigin { queue: String },
    #[error("invalid dead-letter payload: missing job name")]
    MissingName,
}

impl DeadLetterEnvelope {
    /// Parses and validates the raw data of a dead-letter entry.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] when the value does not deserialize, names
    /// the dead-letter queue or an unknown queue as its origin, or carries an
    /// empty job name.
    pub fn parse(raw: &Value, known: &KnownQueues) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_value(raw.clone())
            .map_err(|e| EnvelopeError::Shape(e.to_string()))?;
        envelope.validate(known)?;
        Ok(envelope)
    }

    /// Checks the origin-queue and job-name invariants.
    ///
    /// # Errors
    ///
    /// See [`DeadLetterEnvelope::parse`].
    pub fn validate(&self, known: &KnownQueues) -> Result<(), EnvelopeError> {
        if self.queue == known.dead_letter {
            return Err(EnvelopeError::SelfReferential {
                queue: self.queue.clone(),
            });
        }
        if !known.is_replay_origin(&self.queue) {
            return Err(EnvelopeError::UnknownOrigin {
                queue: self.queue.clone(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(EnvelopeError::MissingName);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn known() -> KnownQueues {
        KnownQueues {
            primary: vec!["geocoding-queue".to_string(), "route-distance-queue".to_string()],
            dead_letter: "dead-letter-queue".to_string(),
        }
    }

    #[test]
    fn parses_well_formed_envelope() {
        let raw = json!({
            "queue": "geocoding-queue",
            "name": "GeocodeAddress",
            "data": {"address": "Kyiv, 1 Khreshchatyk St"},
            "failedReason": "osrm 500",
            "attemptsMade": 3,
            "failedAt": 1_700_000_000_000u64,
        });
        let envelope = DeadLetterEnvelope::parse(&raw, &known()).unwrap();
        assert_eq!(envelope.queue, "geocoding-queue");
        assert_eq!(envelope.name, "GeocodeAddress");
        assert_eq!(envelope.attempts_made, 3);
        assert_eq!(envelope.failed_reason.as_deref(), Some("osrm 500"));
    }

    #[test]
    fn optional_fields_default() {
        let raw = json!({"queue": "route-distance-queue", "name": "RouteDistance", "data": {}});
        let envelope = DeadLetterEnvelope::parse(&raw, &known()).unwrap();
        assert_eq!(envelope.attempts_made, 0);
        assert!(envelope.failed_at.is_none());
    }

    #[test]
    fn metadata_of_unexpected_type_does_not_reject_the_entry() {
        let raw = json!({
            "queue": "geocoding-queue",
            "name": "GeocodeAddress",
            "data": {"address": "Lviv"},
            "failedReason": {"message": "osrm 500"},
            "attemptsMade": "3",
            "failedAt": "2024-01-15T10:30:00.000Z",
        });
        let envelope = DeadLetterEnvelope::parse(&raw, &known()).unwrap();
        assert_eq!(
            envelope.failed_at,
            Some(FailedAt::Text("2024-01-15T10:30:00.000Z".to_string()))
        );
        assert_eq!(envelope.attempts_made, 0);
        assert!(envelope.failed_reason.is_none());
    }

    #[test]
    fn numeric_failure_time_is_kept_as_millis() {
        let raw = json!({
            "queue": "geocoding-queue",
            "name": "GeocodeAddress",
            "data": {},
            "failedAt": 1_700_000_000_000u64,
        });
        let envelope = DeadLetterEnvelope::parse(&raw, &known()).unwrap();
        assert_eq!(envelope.failed_at, Some(FailedAt::Millis(1_700_000_000_000)));
    }

    #[test]
    fn dead_letter_queue_as_origin_is_rejected() {
        let raw = json!({"queue": "dead-letter-queue", "name": "GeocodeAddress", "data": {}});
        let err = DeadLetterEnvelope::parse(&raw, &known()).unwrap_err();
        assert!(matches!(err, EnvelopeError::SelfReferential { .. }));
    }

    #[test]
    fn unknown_origin_is_rejected() {
        let raw = json!({"queue": "billing-queue", "name": "GeocodeAddress", "data": {}});
        let err = DeadLetterEnvelope::parse(&raw, &known()).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::UnknownOrigin {
                queue: "billing-queue".to_string()
            }
        );
    }

    #[test]
    fn missing_fields_are_a_shape_error() {
        let err = DeadLetterEnvelope::parse(&json!({"name": "x"}), &known()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Shape(_)));
        let err = DeadLetterEnvelope::parse(&json!("not an object"), &known()).unwrap_err();
        assert!(matches!(err, EnvelopeError::Shape(_)));
    }

    #[test]
    fn blank_name_is_rejected() {
        let raw = json!({"queue": "geocoding-queue", "name": "  ", "data": {}});
        assert_eq!(
            DeadLetterEnvelope::parse(&raw, &known()).unwrap_err(),
            EnvelopeError::MissingName
        );
    }

    #[test]
    fn error_text_classifies_as_validation() {
        let err = EnvelopeError::MissingName;
        assert_eq!(
            crate::classify("", &err.to_string()),
            crate::ErrorClass::Validation
        );
    }
}
