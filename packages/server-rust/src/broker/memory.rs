//! In-process [`Broker`] implementation.
//!
//! Keeps every queue in a `HashMap` behind one lock and wakes completion
//! waiters through a shared `Notify`. Besides the broker traits it exposes the
//! worker side of the protocol (`take_next`, `complete`, `fail`), fixture
//! seeding, and fault injection, which is what the orchestration tests drive.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, Notify};
use waybill_core::{JobHandle, JobSnapshot, JobState};

use super::{
    Backoff, Broker, BrokerError, ConnectionEvent, JobOptions, NewJob, QueueBackend, QueueEvents,
};
use crate::now_millis;

/// Options used for jobs created through [`MemoryBroker::seed`].
const SEED_OPTIONS: JobOptions = JobOptions {
    attempts: 1,
    backoff: Backoff { base_delay_ms: 0 },
    remove_on_complete: usize::MAX,
    remove_on_fail: usize::MAX,
};

struct StoredJob {
    snapshot: JobSnapshot,
    options: JobOptions,
}

#[derive(Default)]
struct QueueData {
    /// Job ids in insertion order.
    order: Vec<String>,
    jobs: HashMap<String, StoredJob>,
}

impl QueueData {
    fn remove(&mut self, id: &str) -> Option<StoredJob> {
        let removed = self.jobs.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(removed)
    }

    /// Drops the oldest jobs in `state` beyond `keep`.
    fn prune(&mut self, state: JobState, keep: usize) {
        let matching: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.jobs.get(*id).is_some_and(|j| j.snapshot.handle.state == state))
            .cloned()
            .collect();
        if matching.len() > keep {
            for id in &matching[..matching.len() - keep] {
                self.remove(id);
            }
        }
    }
}

#[derive(Default)]
struct Faults {
    unready: Option<String>,
    failing_adds: HashSet<String>,
    failing_retries: HashSet<String>,
    failing_scans: bool,
}

struct MemoryState {
    queues: Mutex<HashMap<String, QueueData>>,
    changed: Notify,
    events: broadcast::Sender<ConnectionEvent>,
    faults: Mutex<Faults>,
    mutations: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
}

impl MemoryState {
    fn readiness(&self) -> Result<(), BrokerError> {
        match &self.faults.lock().unready {
            Some(reason) => Err(BrokerError::Connection(reason.clone())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// In-process at-least-once job store.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(64);
        Self {
            state: Arc::new(MemoryState {
                queues: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                events,
                faults: Mutex::new(Faults::default()),
                mutations: AtomicU64::new(0),
                opened: AtomicU64::new(0),
                closed: AtomicU64::new(0),
            }),
        }
    }

    // ----- worker side -----

    /// Moves the oldest waiting (or delayed) job on `queue` to active.
    pub fn take_next(&self, queue: &str) -> Option<JobSnapshot> {
        let mut queues = self.state.queues.lock();
        let data = queues.get_mut(queue)?;
        let id = data
            .order
            .iter()
            .find(|id| {
                data.jobs.get(*id).is_some_and(|j| {
                    matches!(j.snapshot.handle.state, JobState::Waiting | JobState::Delayed)
                })
            })?
            .clone();
        let job = data.jobs.get_mut(&id)?;
        job.snapshot.handle.state = JobState::Active;
        job.snapshot.handle.started_at = Some(now_millis());
        Some(job.snapshot.clone())
    }

    /// Marks a job completed with `value`. Returns `false` if it is unknown.
    pub fn complete(&self, queue: &str, id: &str, value: Value) -> bool {
        let done = {
            let mut queues = self.state.queues.lock();
            let Some(data) = queues.get_mut(queue) else {
                return false;
            };
            let Some(job) = data.jobs.get_mut(id) else {
                return false;
            };
            let now = now_millis();
            let handle = &mut job.snapshot.handle;
            handle.state = JobState::Completed;
            handle.attempts_made += 1;
            handle.started_at.get_or_insert(now);
            handle.finished_at = Some(now);
            job.snapshot.return_value = Some(value);
            let keep = job.options.remove_on_complete;
            data.prune(JobState::Completed, keep);
            true
        };
        self.state.changed.notify_waiters();
        done
    }

    /// Records a failed attempt. The job goes back to delayed while attempts
    /// remain and to failed once they are exhausted.
    pub fn fail(&self, queue: &str, id: &str, reason: &str) -> bool {
        let done = {
            let mut queues = self.state.queues.lock();
            let Some(data) = queues.get_mut(queue) else {
                return false;
            };
            let Some(job) = data.jobs.get_mut(id) else {
                return false;
            };
            let handle = &mut job.snapshot.handle;
            handle.attempts_made += 1;
            handle.failure_reason = Some(reason.to_string());
            if handle.attempts_made < job.options.attempts {
                handle.state = JobState::Delayed;
            } else {
                handle.state = JobState::Failed;
                handle.finished_at = Some(now_millis());
                let keep = job.options.remove_on_fail;
                data.prune(JobState::Failed, keep);
            }
            true
        };
        self.state.changed.notify_waiters();
        done
    }

    /// Inserts a job directly in `state`, bypassing `add`. Used for fixtures
    /// such as dead-letter entries written by workers.
    pub fn seed(&self, queue: &str, id: &str, name: &str, data: Value, state: JobState) {
        let now = now_millis();
        let handle = JobHandle {
            id: id.to_string(),
            queue: queue.to_string(),
            name: name.to_string(),
            state,
            attempts_made: u32::from(state == JobState::Failed),
            enqueued_at: now,
            started_at: None,
            finished_at: state.is_finished().then_some(now),
            failure_reason: (state == JobState::Failed).then(|| "seeded failure".to_string()),
        };
        let mut queues = self.state.queues.lock();
        let data_map = queues.entry(queue.to_string()).or_default();
        if data_map.jobs.contains_key(id) {
            data_map.remove(id);
        }
        data_map.order.push(id.to_string());
        data_map.jobs.insert(
            id.to_string(),
            StoredJob {
                snapshot: JobSnapshot {
                    handle,
                    data,
                    return_value: None,
                },
                options: SEED_OPTIONS,
            },
        );
    }

    // ----- connection signals and faults -----

    /// Publishes a pool-level connection event.
    pub fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.state.events.send(event);
    }

    /// Makes every readiness check fail with `reason` (or succeed again).
    pub fn set_unready(&self, reason: Option<&str>) {
        self.state.faults.lock().unready = reason.map(str::to_string);
    }

    /// Makes every `add` on `queue` fail.
    pub fn fail_adds_to(&self, queue: &str) {
        self.state.faults.lock().failing_adds.insert(queue.to_string());
    }

    /// Makes `retry` of job `id` fail.
    pub fn fail_retry_of(&self, id: &str) {
        self.state.faults.lock().failing_retries.insert(id.to_string());
    }

    /// Makes every `jobs` listing fail.
    pub fn fail_scans(&self, failing: bool) {
        self.state.faults.lock().failing_scans = failing;
    }

    // ----- inspection -----

    #[must_use]
    pub fn job(&self, queue: &str, id: &str) -> Option<JobSnapshot> {
        let queues = self.state.queues.lock();
        queues
            .get(queue)
            .and_then(|data| data.jobs.get(id))
            .map(|job| job.snapshot.clone())
    }

    /// Number of jobs on `queue` in `state`.
    #[must_use]
    pub fn count(&self, queue: &str, state: JobState) -> usize {
        let queues = self.state.queues.lock();
        queues.get(queue).map_or(0, |data| {
            data.jobs
                .values()
                .filter(|j| j.snapshot.handle.state == state)
                .count()
        })
    }

    /// Number of `add`, `retry` and `remove` calls that reached the store.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.state.mutations.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn opened_handles(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closed_handles(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn open_queue(&self, name: &str) -> Arc<dyn QueueBackend> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryQueue {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }

    fn open_events(&self, name: &str) -> Arc<dyn QueueEvents> {
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemoryEvents {
            name: name.to_string(),
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        })
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

struct MemoryQueue {
    name: String,
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn wait_until_ready(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.readiness()
    }

    async fn add(&self, job: NewJob) -> Result<JobHandle, BrokerError> {
        self.ensure_open()?;
        if self.state.faults.lock().failing_adds.contains(&self.name) {
            return Err(BrokerError::Command(format!(
                "add to {} rejected",
                self.name
            )));
        }
        self.state.mutations.fetch_add(1, Ordering::SeqCst);

        let mut queues = self.state.queues.lock();
        let data = queues.entry(self.name.clone()).or_default();
        if let Some(existing) = data.jobs.get(&job.id) {
            return Ok(existing.snapshot.handle.clone());
        }
        let handle = JobHandle {
            id: job.id.clone(),
            queue: self.name.clone(),
            name: job.name,
            state: JobState::Waiting,
            attempts_made: 0,
            enqueued_at: now_millis(),
            started_at: None,
            finished_at: None,
            failure_reason: None,
        };
        data.order.push(job.id.clone());
        data.jobs.insert(
            job.id,
            StoredJob {
                snapshot: JobSnapshot {
                    handle: handle.clone(),
                    data: job.data,
                    return_value: None,
                },
                options: job.options,
            },
        );
        Ok(handle)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobSnapshot>, BrokerError> {
        self.ensure_open()?;
        let queues = self.state.queues.lock();
        Ok(queues
            .get(&self.name)
            .and_then(|data| data.jobs.get(id))
            .map(|job| job.snapshot.clone()))
    }

    async fn jobs(&self, state: JobState, limit: usize) -> Result<Vec<JobSnapshot>, BrokerError> {
        self.ensure_open()?;
        if self.state.faults.lock().failing_scans {
            return Err(BrokerError::Connection("ECONNREFUSED".to_string()));
        }
        let queues = self.state.queues.lock();
        let Some(data) = queues.get(&self.name) else {
            return Ok(Vec::new());
        };
        Ok(data
            .order
            .iter()
            .filter_map(|id| data.jobs.get(id))
            .filter(|job| job.snapshot.handle.state == state)
            .take(limit)
            .map(|job| job.snapshot.clone())
            .collect())
    }

    async fn retry(&self, id: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.state.faults.lock().failing_retries.contains(id) {
            return Err(BrokerError::Command(format!("retry of {id} rejected")));
        }
        self.state.mutations.fetch_add(1, Ordering::SeqCst);

        let mut queues = self.state.queues.lock();
        let job = queues
            .get_mut(&self.name)
            .and_then(|data| data.jobs.get_mut(id))
            .ok_or_else(|| BrokerError::NotFound { id: id.to_string() })?;
        if job.snapshot.handle.state != JobState::Failed {
            return Err(BrokerError::Command(format!("job {id} is not failed")));
        }
        job.snapshot.handle.state = JobState::Waiting;
        job.snapshot.handle.finished_at = None;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.mutations.fetch_add(1, Ordering::SeqCst);
        let removed = self
            .state
            .queues
            .lock()
            .get_mut(&self.name)
            .and_then(|data| data.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::NotFound { id: id.to_string() }),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryEvents {
    name: String,
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

#[async_trait]
impl QueueEvents for MemoryEvents {
    async fn wait_until_ready(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.state.readiness()
    }

    async fn wait_until_finished(&self, id: &str) -> Result<Value, BrokerError> {
        loop {
            // Register interest before looking, so a completion landing in
            // between is not missed.
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }
            {
                let queues = self.state.queues.lock();
                let job = queues
                    .get(&self.name)
                    .and_then(|data| data.jobs.get(id))
                    .ok_or_else(|| BrokerError::NotFound { id: id.to_string() })?;
                match job.snapshot.handle.state {
                    JobState::Completed => {
                        return Ok(job.snapshot.return_value.clone().unwrap_or(Value::Null));
                    }
                    JobState::Failed => {
                        return Err(BrokerError::JobFailed {
                            id: id.to_string(),
                            reason: job
                                .snapshot
                                .handle
                                .failure_reason
                                .clone()
                                .unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            self.state.changed.notify_waiters();
        }
        Ok(())
    }
}
