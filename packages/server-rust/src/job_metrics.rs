//! Job outcome metrics.
//!
//! Every sample goes to the `metrics` facade (exported by
//! `metrics-exporter-prometheus` in the server binary) and is mirrored in an
//! in-process registry, so health reports and tests can read exact values
//! without a global recorder.

use std::time::Duration;

use dashmap::DashMap;
use waybill_core::{ErrorClass, JobKind, Outcome};

/// Counter of jobs that reached an outcome, labeled
/// `queue`, `job_kind`, `status`, `error_class`.
pub const JOBS_PROCESSED_TOTAL: &str = "waybill_queue_jobs_processed_total";
/// Histogram of how long callers waited for a job, labeled
/// `queue`, `job_kind`, `status`.
pub const JOB_WAIT_SECONDS: &str = "waybill_queue_job_wait_duration_seconds";
/// Histogram of broker-side processing time (finish minus start), labeled
/// `queue`, `job_kind`, `status`.
pub const JOB_PROCESSING_SECONDS: &str = "waybill_queue_job_processing_duration_seconds";

/// `error_class` label for successful outcomes.
pub const NO_ERROR: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub queue: String,
    pub job_kind: JobKind,
    pub status: Outcome,
    pub error_class: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistogramKey {
    pub queue: String,
    pub job_kind: JobKind,
    pub status: Outcome,
}

/// Count, sum and max of the samples recorded into one histogram series.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum_seconds: f64,
    pub max_seconds: f64,
}

impl HistogramSummary {
    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.sum_seconds += seconds;
        if seconds > self.max_seconds {
            self.max_seconds = seconds;
        }
    }
}

/// Shared metrics registry for the queue layer.
#[derive(Debug, Default)]
pub struct JobMetrics {
    processed: DashMap<CounterKey, u64>,
    wait: DashMap<HistogramKey, HistogramSummary>,
    processing: DashMap<HistogramKey, HistogramSummary>,
}

impl JobMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one job outcome. `error_class` is `None` for completed jobs.
    pub fn record_processed(
        &self,
        queue: &str,
        kind: JobKind,
        status: Outcome,
        error_class: Option<ErrorClass>,
    ) {
        let class = error_class.map_or(NO_ERROR, ErrorClass::as_str);
        metrics::counter!(
            JOBS_PROCESSED_TOTAL,
            "queue" => queue.to_string(),
            "job_kind" => kind.as_str(),
            "status" => status.as_str(),
            "error_class" => class
        )
        .increment(1);

        let key = CounterKey {
            queue: queue.to_string(),
            job_kind: kind,
            status,
            error_class: class,
        };
        *self.processed.entry(key).or_insert(0) += 1;
    }

    /// Records how long a caller waited for a job.
    pub fn record_wait(&self, queue: &str, kind: JobKind, status: Outcome, waited: Duration) {
        let seconds = waited.as_secs_f64();
        metrics::histogram!(
            JOB_WAIT_SECONDS,
            "queue" => queue.to_string(),
            "job_kind" => kind.as_str(),
            "status" => status.as_str()
        )
        .record(seconds);
        self.wait
            .entry(histogram_key(queue, kind, status))
            .or_default()
            .observe(seconds);
    }

    /// Records broker-side processing time of a completed job.
    pub fn record_processing(&self, queue: &str, kind: JobKind, took: Duration) {
        let seconds = took.as_secs_f64();
        metrics::histogram!(
            JOB_PROCESSING_SECONDS,
            "queue" => queue.to_string(),
            "job_kind" => kind.as_str(),
            "status" => Outcome::Completed.as_str()
        )
        .record(seconds);
        self.processing
            .entry(histogram_key(queue, kind, Outcome::Completed))
            .or_default()
            .observe(seconds);
    }

    /// Current value of one processed-counter series.
    #[must_use]
    pub fn processed_count(
        &self,
        queue: &str,
        kind: JobKind,
        status: Outcome,
        error_class: Option<ErrorClass>,
    ) -> u64 {
        let key = CounterKey {
            queue: queue.to_string(),
            job_kind: kind,
            status,
            error_class: error_class.map_or(NO_ERROR, ErrorClass::as_str),
        };
        self.processed.get(&key).map_or(0, |v| *v)
    }

    /// Sum over every processed-counter series.
    #[must_use]
    pub fn processed_total(&self) -> u64 {
        self.processed.iter().map(|entry| *entry.value()).sum()
    }

    #[must_use]
    pub fn wait_summary(&self, queue: &str, kind: JobKind, status: Outcome) -> HistogramSummary {
        self.wait
            .get(&histogram_key(queue, kind, status))
            .map(|v| *v)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn processing_summary(&self, queue: &str, kind: JobKind) -> HistogramSummary {
        self.processing
            .get(&histogram_key(queue, kind, Outcome::Completed))
            .map(|v| *v)
            .unwrap_or_default()
    }
}

fn histogram_key(queue: &str, kind: JobKind, status: Outcome) -> HistogramKey {
    HistogramKey {
        queue: queue.to_string(),
        job_kind: kind,
        status,
    }
}
