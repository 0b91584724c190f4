use std::time::Duration;

use waybill_core::{JobKind, KnownQueues};

use crate::broker::{Backoff, JobOptions};

/// Queue-layer configuration.
///
/// Controls which broker to use, queue names, job options, and how long
/// callers wait for a result before falling back.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Broker connection descriptor. `None` keeps the circuit permanently
    /// disabled and every call takes the fallback path.
    pub broker_url: Option<String>,
    pub geocoding_queue: String,
    pub route_distance_queue: String,
    pub dead_letter_queue: String,
    /// Attempts per job before the broker marks it failed.
    pub attempts: u32,
    /// Base delay of the exponential backoff between attempts, in milliseconds.
    pub backoff_base_ms: u64,
    /// Completed jobs the broker keeps per queue.
    pub remove_on_complete: usize,
    /// Failed jobs the broker keeps per queue.
    pub remove_on_fail: usize,
    /// How long a caller waits for a dispatched job before falling back.
    pub wait_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            geocoding_queue: "geocoding-queue".to_string(),
            route_distance_queue: "route-distance-queue".to_string(),
            dead_letter_queue: "dead-letter-queue".to_string(),
            attempts: 3,
            backoff_base_ms: 1000,
            remove_on_complete: 1000,
            remove_on_fail: 5000,
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Invalid [`QueueConfig`] values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("queue name `{field}` must not be empty")]
    EmptyQueueName { field: &'static str },
    #[error("queue name `{name}` is used more than once")]
    DuplicateQueueName { name: String },
    #[error("attempts must be at least 1")]
    ZeroAttempts,
}

impl QueueConfig {
    /// Checks queue names and attempt counts.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for empty or duplicate queue names and for a
    /// zero attempt count.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names = [
            ("geocoding_queue", &self.geocoding_queue),
            ("route_distance_queue", &self.route_distance_queue),
            ("dead_letter_queue", &self.dead_letter_queue),
        ];
        for (field, name) in names {
            if name.trim().is_empty() {
                return Err(ConfigError::EmptyQueueName { field });
            }
        }
        for (i, (_, a)) in names.iter().enumerate() {
            if names[i + 1..].iter().any(|(_, b)| a == b) {
                return Err(ConfigError::DuplicateQueueName {
                    name: (*a).clone(),
                });
            }
        }
        if self.attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }

    /// Queue that jobs of `kind` are dispatched to.
    #[must_use]
    pub fn queue_for(&self, kind: JobKind) -> &str {
        match kind {
            JobKind::GeocodeAddress => &self.geocoding_queue,
            JobKind::RouteDistance => &self.route_distance_queue,
        }
    }

    #[must_use]
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            backoff: Backoff {
                base_delay_ms: self.backoff_base_ms,
            },
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }

    /// The valid dead-letter replay origins plus the dead-letter queue itself.
    #[must_use]
    pub fn known_queues(&self) -> KnownQueues {
        KnownQueues {
            primary: vec![
                self.geocoding_queue.clone(),
                self.route_distance_queue.clone(),
            ],
            dead_letter: self.dead_letter_queue.clone(),
        }
    }
}
