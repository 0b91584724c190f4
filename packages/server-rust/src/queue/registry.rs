use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitState};
use crate::broker::{Broker, ConnectionEvent, QueueBackend, QueueEvents};

// ---------------------------------------------------------------------------
// QueueLease
// ---------------------------------------------------------------------------

/// A queue handle and its event subscription, as handed out by the registry.
///
/// Leases are cheap clones of shared handles. When the circuit trips the
/// registry closes the underlying handles; operations on a stale lease then
/// fail with `BrokerError::Closed`.
#[derive(Clone)]
pub struct QueueLease {
    pub queue: Arc<dyn QueueBackend>,
    pub events: Arc<dyn QueueEvents>,
}

struct QueueEntry {
    lease: QueueLease,
    generation: u64,
}

// ---------------------------------------------------------------------------
// QueueRegistry
// ---------------------------------------------------------------------------

/// Owns one lazily opened handle pair per queue name.
///
/// `get_queue` returns `None` whenever the circuit is disabled or no broker
/// is configured; callers treat that as the signal to compute synchronously.
pub struct QueueRegistry {
    broker: Option<Arc<dyn Broker>>,
    circuit: Arc<CircuitBreaker>,
    handles: Mutex<HashMap<String, QueueEntry>>,
    watcher_started: AtomicBool,
}

impl QueueRegistry {
    /// Creates a registry over `broker`. Without a broker the circuit stays
    /// disabled for the life of the process.
    #[must_use]
    pub fn new(broker: Option<Arc<dyn Broker>>) -> Arc<Self> {
        let circuit = Arc::new(CircuitBreaker::new(broker.is_some()));
        if broker.is_none() {
            info!("no broker configured, queue circuit disabled");
        }
        Arc::new(Self {
            broker,
            circuit,
            handles: Mutex::new(HashMap::new()),
            watcher_started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn circuit(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.circuit)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.circuit.is_enabled()
    }

    /// Number of queues with open handles.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns the lease for `name`, opening it on first access.
    ///
    /// A freshly opened pair gets an asynchronous readiness check. A failure
    /// trips the circuit and closes every handle, unless the circuit has
    /// already moved past the generation the handles were opened at. Must be
    /// called from within a tokio runtime.
    pub fn get_queue(self: &Arc<Self>, name: &str) -> Option<QueueLease> {
        let broker = self.broker.as_ref()?;
        if !self.circuit.is_enabled() {
            return None;
        }
        self.ensure_watcher(broker.as_ref());

        let (lease, generation) = {
            let mut handles = self.handles.lock();
            if let Some(entry) = handles.get(name) {
                return Some(entry.lease.clone());
            }
            // Re-checked under the map lock: a trip that already ran
            // `close_all` must not be followed by a fresh insert.
            let CircuitState {
                enabled,
                generation,
            } = self.circuit.state();
            if !enabled {
                return None;
            }
            let lease = QueueLease {
                queue: broker.open_queue(name),
                events: broker.open_events(name),
            };
            handles.insert(
                name.to_string(),
                QueueEntry {
                    lease: lease.clone(),
                    generation,
                },
            );
            (lease, generation)
        };

        debug!(queue = name, generation, "opened queue handles");
        self.spawn_readiness_check(name.to_string(), lease.clone(), generation);
        Some(lease)
    }

    /// Opens a queue handle that the registry does not track.
    ///
    /// The caller owns it and must close it. Returns `None` while the circuit
    /// is disabled.
    #[must_use]
    pub fn open_detached(&self, name: &str) -> Option<Arc<dyn QueueBackend>> {
        let broker = self.broker.as_ref()?;
        if !self.circuit.is_enabled() {
            return None;
        }
        Some(broker.open_queue(name))
    }

    /// Trips the circuit and closes every open handle.
    pub async fn disable(&self, reason: &str) {
        self.circuit.trip(reason);
        self.close_all().await;
    }

    /// Closes and evicts every open handle.
    ///
    /// Entries are detached from the map under its lock before any close
    /// call, so concurrent callers never close the same handle twice.
    pub async fn close_all(&self) {
        let drained: Vec<(String, QueueEntry)> = {
            let mut handles = self.handles.lock();
            handles.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "closing queue handles");
        for (name, entry) in drained {
            if let Err(e) = entry.lease.queue.close().await {
                debug!(queue = %name, error = %e, "queue close failed");
            }
            if let Err(e) = entry.lease.events.close().await {
                debug!(queue = %name, error = %e, "queue events close failed");
            }
            debug!(queue = %name, generation = entry.generation, "queue handles closed");
        }
    }

    /// Closes every handle at process exit.
    pub async fn shutdown(&self) {
        self.close_all().await;
    }

    fn spawn_readiness_check(self: &Arc<Self>, name: String, lease: QueueLease, generation: u64) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let ready = tokio::try_join!(
                lease.queue.wait_until_ready(),
                lease.events.wait_until_ready()
            );
            match ready {
                Ok(_) => {
                    if registry.circuit.confirm_ready(generation) {
                        debug!(queue = %name, generation, "queue ready");
                    }
                }
                Err(e) => {
                    warn!(queue = %name, generation, error = %e, "queue readiness check failed");
                    if registry.circuit.trip_if_current(generation, &e.to_string()) {
                        registry.close_all().await;
                    }
                }
            }
        });
    }

    /// Subscribes to pool-level connection events once per registry.
    ///
    /// The watcher holds only a weak reference, so it ends with the registry.
    fn ensure_watcher(self: &Arc<Self>, broker: &dyn Broker) {
        if self
            .watcher_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let mut events = broker.connection_events();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "connection watcher lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                match event {
                    ConnectionEvent::Error(reason) => {
                        warn!(reason = %reason, "broker connection error");
                        registry.disable(&reason).await;
                    }
                    ConnectionEvent::Ready => {
                        registry.circuit.reset();
                    }
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::MemoryBroker;

    fn registry_with(broker: &MemoryBroker) -> Arc<QueueRegistry> {
        QueueRegistry::new(Some(Arc::new(broker.clone())))
    }

    /// Lets spawned readiness and watcher tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn no_broker_means_no_queue() {
        let registry = QueueRegistry::new(None);
        assert!(!registry.is_enabled());
        assert!(registry.get_queue("geocoding-queue").is_none());
        assert!(registry.open_detached("geocoding-queue").is_none());
    }

    #[tokio::test]
    async fn first_access_opens_handles_once() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);

        let a = registry.get_queue("geocoding-queue").unwrap();
        let b = registry.get_queue("geocoding-queue").unwrap();
        assert!(Arc::ptr_eq(&a.queue, &b.queue));
        assert_eq!(broker.opened_handles(), 2);
        assert_eq!(registry.open_count(), 1);

        settle().await;
        assert!(registry.is_enabled());
    }

    #[tokio::test]
    async fn failed_readiness_disables_and_closes_everything() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        registry.get_queue("route-distance-queue").unwrap();
        settle().await;

        broker.set_unready(Some("connect ECONNREFUSED 127.0.0.1:6379"));
        registry.get_queue("geocoding-queue").unwrap();
        settle().await;

        assert!(!registry.is_enabled());
        assert_eq!(registry.open_count(), 0);
        assert_eq!(broker.closed_handles(), 4);
        assert!(registry.get_queue("geocoding-queue").is_none());
    }

    #[tokio::test]
    async fn connection_error_event_trips_and_ready_event_re_enables() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        registry.get_queue("geocoding-queue").unwrap();
        settle().await;

        broker.emit(ConnectionEvent::Error("Connection is closed".to_string()));
        settle().await;
        assert!(!registry.is_enabled());
        assert_eq!(registry.open_count(), 0);

        broker.emit(ConnectionEvent::Ready);
        settle().await;
        assert!(registry.is_enabled());

        // Handles are reopened on the next access.
        let lease = registry.get_queue("geocoding-queue").unwrap();
        assert!(lease.queue.wait_until_ready().await.is_ok());
        assert_eq!(broker.opened_handles(), 4);
    }

    #[tokio::test]
    async fn stale_readiness_failure_does_not_trip_a_re_enabled_circuit() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        // The readiness check is spawned but has not run yet.
        registry.get_queue("geocoding-queue").unwrap();

        // Error then recovery land first; the check then sees closed handles.
        registry.disable("Connection is closed").await;
        assert!(registry.circuit().reset());
        let recovered = registry.circuit().state();
        settle().await;

        assert!(registry.is_enabled());
        assert_eq!(registry.circuit().state(), recovered);
        assert!(registry.get_queue("geocoding-queue").is_some());
    }

    #[tokio::test]
    async fn stale_readiness_success_does_not_re_enable() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        registry.get_queue("geocoding-queue").unwrap();
        settle().await;
        let generation = registry.circuit().state().generation;

        registry.disable("Connection is closed").await;
        settle().await;

        assert!(!registry.circuit().confirm_ready(generation));
        assert!(!registry.is_enabled());
    }

    #[tokio::test]
    async fn concurrent_close_all_closes_each_handle_once() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        registry.get_queue("geocoding-queue").unwrap();
        registry.get_queue("route-distance-queue").unwrap();
        registry.get_queue("dead-letter-queue").unwrap();

        let (a, b) = (Arc::clone(&registry), Arc::clone(&registry));
        let first = tokio::spawn(async move { a.close_all().await });
        let second = tokio::spawn(async move { b.close_all().await });
        first.await.unwrap();
        second.await.unwrap();
        registry.close_all().await;

        assert_eq!(broker.opened_handles(), 6);
        assert_eq!(broker.closed_handles(), 6);
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn detached_handles_are_not_tracked() {
        let broker = MemoryBroker::new();
        let registry = registry_with(&broker);
        let handle = registry.open_detached("dead-letter-queue").unwrap();
        assert_eq!(registry.open_count(), 0);
        registry.close_all().await;
        assert!(handle.wait_until_ready().await.is_ok());
        handle.close().await.unwrap();
        assert_eq!(broker.closed_handles(), 1);
    }
}
