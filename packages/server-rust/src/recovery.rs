//! Dead-letter diagnostics and replay.
//!
//! Operators use this to inspect jobs that exhausted their retries and to
//! push them back onto their origin queues. Both operations open their own
//! detached queue handles and close every one of them before returning,
//! whatever happened in between.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use waybill_core::{DeadLetterEnvelope, JobSnapshot, JobState};

use crate::broker::{BrokerError, NewJob, QueueBackend};
use crate::config::QueueConfig;
use crate::now_millis;
use crate::queue::QueueRegistry;

/// Smallest accepted scan limit.
pub const MIN_LIMIT: usize = 1;
/// Largest accepted scan limit.
pub const MAX_LIMIT: usize = 200;
/// Default scan limit of a recovery pass.
pub const DEFAULT_RECOVERY_LIMIT: usize = 50;

/// Clamps a requested scan limit into `[MIN_LIMIT, MAX_LIMIT]`.
#[must_use]
pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(MIN_LIMIT, MAX_LIMIT)
}

// ---------------------------------------------------------------------------
// Options and reports
// ---------------------------------------------------------------------------

/// Parameters of one recovery pass. Every field is optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryOptions {
    pub dry_run: bool,
    pub geocoding_failed_limit: usize,
    pub dead_letter_limit: usize,
    pub remove_replayed_dead_letter: bool,
    pub remove_skipped_dead_letter: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            geocoding_failed_limit: DEFAULT_RECOVERY_LIMIT,
            dead_letter_limit: DEFAULT_RECOVERY_LIMIT,
            remove_replayed_dead_letter: false,
            remove_skipped_dead_letter: false,
        }
    }
}

impl RecoveryOptions {
    /// Returns the options with both limits clamped.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            geocoding_failed_limit: clamp_limit(self.geocoding_failed_limit),
            dead_letter_limit: clamp_limit(self.dead_letter_limit),
            ..self
        }
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub enabled: bool,
    pub dry_run: bool,
    pub geocoding_failed_scanned: usize,
    pub geocoding_retried: usize,
    pub dead_letter_scanned: usize,
    pub dead_letter_replayed: usize,
    pub dead_letter_removed: usize,
    pub dead_letter_skipped: usize,
    pub dead_letter_skipped_removed: usize,
    /// `"<job-id>: <message>"` per job that could not be processed.
    pub errors: Vec<String>,
}

impl RecoveryReport {
    fn disabled(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    fn error(&mut self, id: &str, message: impl std::fmt::Display) {
        self.errors.push(format!("{id}: {message}"));
    }
}

/// Lightweight view of one job for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub attempts_made: u32,
    pub failed_reason: Option<String>,
    /// Enqueue time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub data: Value,
}

impl From<JobSnapshot> for JobView {
    fn from(job: JobSnapshot) -> Self {
        Self {
            id: job.handle.id,
            name: job.handle.name,
            queue: job.handle.queue,
            attempts_made: job.handle.attempts_made,
            failed_reason: job.handle.failure_reason,
            timestamp: job.handle.enqueued_at,
            data: job.data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub enabled: bool,
    pub geocoding_failed: Vec<JobView>,
    pub dead_letter_waiting: Vec<JobView>,
    pub dead_letter_failed: Vec<JobView>,
}

impl DiagnosticsReport {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Handle scope
// ---------------------------------------------------------------------------

/// Detached handles opened during one operation.
struct HandleScope<'a> {
    registry: &'a QueueRegistry,
    handles: HashMap<String, Arc<dyn QueueBackend>>,
}

impl<'a> HandleScope<'a> {
    fn new(registry: &'a QueueRegistry) -> Self {
        Self {
            registry,
            handles: HashMap::new(),
        }
    }

    /// Returns the handle for `name`, opening it on first use. `None` once
    /// the circuit is disabled.
    fn queue(&mut self, name: &str) -> Option<Arc<dyn QueueBackend>> {
        if let Some(handle) = self.handles.get(name) {
            return Some(Arc::clone(handle));
        }
        let handle = self.registry.open_detached(name)?;
        self.handles.insert(name.to_string(), Arc::clone(&handle));
        Some(handle)
    }

    async fn close(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.close().await {
                debug!(queue = %name, error = %e, "recovery handle close failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryService
// ---------------------------------------------------------------------------

/// Inspects and replays failed and dead-lettered jobs.
pub struct RecoveryService {
    registry: Arc<QueueRegistry>,
    config: Arc<QueueConfig>,
    /// Serializes recovery passes.
    pass: Mutex<()>,
}

impl RecoveryService {
    #[must_use]
    pub fn new(registry: Arc<QueueRegistry>, config: Arc<QueueConfig>) -> Self {
        Self {
            registry,
            config,
            pass: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.registry.is_enabled()
    }

    /// Lists up to `limit` failed geocoding jobs, waiting dead-letter entries
    /// and failed dead-letter entries.
    ///
    /// Never fails: a scan error is logged and leaves its list empty.
    pub async fn collect_diagnostics(&self, limit: usize) -> DiagnosticsReport {
        if !self.registry.is_enabled() {
            return DiagnosticsReport::disabled();
        }
        let limit = clamp_limit(limit);
        let mut scope = HandleScope::new(&self.registry);

        let geocoding_failed = scan(
            &mut scope,
            &self.config.geocoding_queue,
            JobState::Failed,
            limit,
        )
        .await;
        let dead_letter_waiting = scan(
            &mut scope,
            &self.config.dead_letter_queue,
            JobState::Waiting,
            limit,
        )
        .await;
        let dead_letter_failed = scan(
            &mut scope,
            &self.config.dead_letter_queue,
            JobState::Failed,
            limit,
        )
        .await;
        scope.close().await;

        DiagnosticsReport {
            enabled: true,
            geocoding_failed,
            dead_letter_waiting,
            dead_letter_failed,
        }
    }

    /// Retries failed geocoding jobs and replays dead-letter entries onto
    /// their origin queues.
    ///
    /// A dry run performs the same scans and validation and reports the counts
    /// a live run would produce, without any retry, add or remove call.
    /// Failures of individual jobs are collected in
    /// [`RecoveryReport::errors`] and do not stop the pass.
    ///
    /// # Errors
    ///
    /// Returns the broker error when a scan itself fails. Handles opened by
    /// the pass are closed first.
    #[instrument(skip(self), fields(dry_run = options.dry_run))]
    pub async fn recover(&self, options: RecoveryOptions) -> Result<RecoveryReport, BrokerError> {
        let options = options.clamped();
        if !self.registry.is_enabled() {
            return Ok(RecoveryReport::disabled(options.dry_run));
        }

        let _pass = self.pass.lock().await;
        let mut scope = HandleScope::new(&self.registry);
        let result = self.run_pass(&mut scope, options).await;
        scope.close().await;

        match &result {
            Ok(report) => info!(
                retried = report.geocoding_retried,
                replayed = report.dead_letter_replayed,
                skipped = report.dead_letter_skipped,
                errors = report.errors.len(),
                "recovery pass finished"
            ),
            Err(e) => warn!(error = %e, "recovery pass aborted"),
        }
        result
    }

    async fn run_pass(
        &self,
        scope: &mut HandleScope<'_>,
        options: RecoveryOptions,
    ) -> Result<RecoveryReport, BrokerError> {
        let mut report = RecoveryReport {
            enabled: true,
            dry_run: options.dry_run,
            ..RecoveryReport::default()
        };

        // Failed geocoding jobs are retried in place.
        let geocoding = scope
            .queue(&self.config.geocoding_queue)
            .ok_or(BrokerError::Closed)?;
        let failed = geocoding
            .jobs(JobState::Failed, options.geocoding_failed_limit)
            .await?;
        for job in failed {
            report.geocoding_failed_scanned += 1;
            if options.dry_run {
                report.geocoding_retried += 1;
                continue;
            }
            match geocoding.retry(&job.handle.id).await {
                Ok(()) => report.geocoding_retried += 1,
                Err(e) => report.error(&job.handle.id, e),
            }
        }

        let dead_letter = scope
            .queue(&self.config.dead_letter_queue)
            .ok_or(BrokerError::Closed)?;
        let entries = dead_letter
            .jobs(JobState::Waiting, options.dead_letter_limit)
            .await?;
        let known = self.config.known_queues();
        for entry in entries {
            report.dead_letter_scanned += 1;
            let id = entry.handle.id.as_str();

            let envelope = match DeadLetterEnvelope::parse(&entry.data, &known) {
                Ok(envelope) => envelope,
                Err(e) => {
                    report.dead_letter_skipped += 1;
                    report.error(id, &e);
                    if !options.dry_run && options.remove_skipped_dead_letter {
                        match dead_letter.remove(id).await {
                            Ok(()) => report.dead_letter_skipped_removed += 1,
                            Err(e) => report.error(id, e),
                        }
                    }
                    continue;
                }
            };

            if options.dry_run {
                report.dead_letter_replayed += 1;
                continue;
            }

            let Some(target) = scope.queue(&envelope.queue) else {
                report.error(id, "queue circuit open");
                continue;
            };
            let replay = NewJob {
                id: replay_id(id, now_millis()),
                name: envelope.name,
                data: envelope.data,
                options: self.config.job_options(),
            };
            match target.add(replay).await {
                Ok(handle) => {
                    report.dead_letter_replayed += 1;
                    debug!(
                        dead_letter_id = id,
                        replay_id = %handle.id,
                        queue = %envelope.queue,
                        "dead-letter entry replayed"
                    );
                }
                Err(e) => {
                    report.error(id, e);
                    continue;
                }
            }

            if options.remove_replayed_dead_letter {
                match dead_letter.remove(id).await {
                    Ok(()) => report.dead_letter_removed += 1,
                    Err(e) => report.error(id, e),
                }
            }
        }

        Ok(report)
    }
}

/// Job id of a replay. Includes the time so a replay never collapses onto
/// the original job or an earlier replay.
fn replay_id(original: &str, at_millis: u64) -> String {
    format!("replay:{original}:{at_millis}")
}

async fn scan(
    scope: &mut HandleScope<'_>,
    queue: &str,
    state: JobState,
    limit: usize,
) -> Vec<JobView> {
    let Some(handle) = scope.queue(queue) else {
        return Vec::new();
    };
    match handle.jobs(state, limit).await {
        Ok(jobs) => jobs.into_iter().map(JobView::from).collect(),
        Err(e) => {
            warn!(queue, state = ?state, error = %e, "diagnostics scan failed");
            Vec::new()
        }
    }
}
