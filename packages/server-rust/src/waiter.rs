//! Waiting for dispatched jobs, with synchronous fallback.
//!
//! The waiter never surfaces a broker-side failure. A timeout, a failed job,
//! a closed event stream, an undecodable result, or a submission that never
//! reached the broker all end the same way: an outcome metric labeled with
//! the error class, then the caller's fallback computes the value in-process.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use waybill_core::{classify_error, ErrorClass, JobKind, Outcome};

use crate::broker::BrokerError;
use crate::dispatch::{DispatchError, Submission};
use crate::job_metrics::JobMetrics;

/// Why waiting on a job did not produce a usable value.
#[derive(Debug, thiserror::Error)]
enum WaitFailure {
    #[error("TimeoutError: job {id} did not finish within {timeout_ms}ms")]
    TimedOut { id: String, timeout_ms: u64 },
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("invalid job result: {0}")]
    InvalidResult(String),
}

impl WaitFailure {
    fn outcome(&self) -> Outcome {
        match self {
            Self::TimedOut { .. } => Outcome::Timeout,
            Self::Broker(_) | Self::InvalidResult(_) => Outcome::Failed,
        }
    }
}

/// Waits for job results and records outcome metrics.
#[derive(Clone)]
pub struct ResultWaiter {
    metrics: Arc<JobMetrics>,
}

impl ResultWaiter {
    #[must_use]
    pub fn new(metrics: Arc<JobMetrics>) -> Self {
        Self { metrics }
    }

    /// Resolves a submission into a value.
    ///
    /// On completion within `timeout` the job's return value is decoded into
    /// `T`. On any other path `fallback` is awaited and its result returned.
    ///
    /// # Errors
    ///
    /// Only the fallback's own error. Broker-side failures are absorbed.
    #[allow(clippy::cast_possible_truncation)]
    pub async fn await_result<T, E, F, Fut>(
        &self,
        queue: &str,
        kind: JobKind,
        submission: Result<Submission, DispatchError>,
        timeout: Duration,
        fallback: F,
    ) -> Result<T, E>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let submission = match submission {
            Ok(submission) => submission,
            Err(err) => {
                if matches!(err, DispatchError::Broker { .. }) {
                    warn!(queue, kind = %kind, error = %err, "job submission failed, using fallback");
                } else {
                    debug!(queue, kind = %kind, "queue unavailable, using fallback");
                }
                self.metrics
                    .record_processed(queue, kind, Outcome::Failed, Some(ErrorClass::Unknown));
                return fallback().await;
            }
        };

        let id = submission.handle.id.as_str();
        let started = Instant::now();
        let waited = tokio::time::timeout(
            timeout,
            submission.lease.events.wait_until_finished(id),
        )
        .await;
        let elapsed = started.elapsed();

        let failure = match waited {
            Ok(Ok(value)) => match serde_json::from_value::<T>(value) {
                Ok(result) => {
                    self.metrics
                        .record_wait(queue, kind, Outcome::Completed, elapsed);
                    self.metrics
                        .record_processed(queue, kind, Outcome::Completed, None);
                    self.record_processing(queue, kind, &submission).await;
                    return Ok(result);
                }
                Err(e) => WaitFailure::InvalidResult(e.to_string()),
            },
            Ok(Err(e)) => WaitFailure::Broker(e),
            Err(_elapsed) => WaitFailure::TimedOut {
                id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            },
        };

        let outcome = failure.outcome();
        let class = classify_error(&failure);
        self.metrics.record_wait(queue, kind, outcome, elapsed);
        self.metrics
            .record_processed(queue, kind, outcome, Some(class));
        warn!(
            queue,
            kind = %kind,
            job_id = id,
            outcome = outcome.as_str(),
            error_class = class.as_str(),
            error = %failure,
            "job did not complete, using fallback"
        );
        fallback().await
    }

    /// Best effort: records broker-side processing time when the job's
    /// start and finish stamps can be read back.
    async fn record_processing(&self, queue: &str, kind: JobKind, submission: &Submission) {
        let id = &submission.handle.id;
        match submission.lease.queue.get_job(id).await {
            Ok(Some(job)) => {
                if let Some(millis) = job.handle.processing_millis() {
                    self.metrics
                        .record_processing(queue, kind, Duration::from_millis(millis));
                }
            }
            Ok(None) => debug!(job_id = %id, "completed job already reaped"),
            Err(e) => debug!(job_id = %id, error = %e, "could not read job timings"),
        }
    }
}
