//! Process-wide context shared by every operation.
//!
//! [`ProcessContext`] is built once at startup and handed to every component
//! that needs the engine connection, the active-operation registry, the lock
//! manager or the interrupt fail point.

use crate::connection::EngineConnection;
use crate::lock::LockManager;
use crate::types::OperationId;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hands out process-unique, increasing operation ids.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Creates a generator whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> OperationId {
        OperationId(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Kill and deadline state of one running operation.
#[derive(Debug)]
pub struct CurOp {
    id: OperationId,
    connection_id: u64,
    nested: bool,
    started: Instant,
    killed: AtomicBool,
    deadline: Mutex<Option<Instant>>,
}

impl CurOp {
    /// Returns the operation id.
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Returns the client connection the operation runs for.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns true if the operation runs inside another operation.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// Marks the operation killed.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Returns true once the operation has been killed.
    #[must_use]
    pub fn kill_pending(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Sets a time limit measured from now. A limit too far out to be
    /// represented means no limit.
    pub fn set_max_time(&self, limit: Duration) {
        *self.deadline.lock() = Instant::now().checked_add(limit);
    }

    /// Removes the time limit.
    pub fn clear_max_time(&self) {
        *self.deadline.lock() = None;
    }

    /// Returns true if the time limit has passed.
    #[must_use]
    pub fn max_time_has_expired(&self) -> bool {
        self.deadline.lock().is_some_and(|d| Instant::now() >= d)
    }

    /// Returns the time remaining before the limit, if one is set.
    #[must_use]
    pub fn remaining_max_time(&self) -> Option<Duration> {
        self.deadline
            .lock()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns how long the operation has been running.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Registry of the operations currently running in the process.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    ids: IdGenerator,
    ops: Mutex<HashMap<OperationId, Arc<CurOp>>>,
    kill_all: AtomicBool,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns an id to a new operation and registers it.
    pub fn register(&self, connection_id: u64, nested: bool) -> Arc<CurOp> {
        let op = Arc::new(CurOp {
            id: self.ids.next_id(),
            connection_id,
            nested,
            started: Instant::now(),
            killed: AtomicBool::new(false),
            deadline: Mutex::new(None),
        });
        self.ops.lock().insert(op.id, Arc::clone(&op));
        op
    }

    /// Removes a finished operation.
    pub fn unregister(&self, id: OperationId) {
        self.ops.lock().remove(&id);
    }

    /// Kills one operation. Returns false if it is not running.
    pub fn kill_operation(&self, id: OperationId) -> bool {
        match self.ops.lock().get(&id) {
            Some(op) => {
                op.kill();
                tracing::info!(op = %id, "operation killed");
                true
            }
            None => false,
        }
    }

    /// Raises the shutdown flag that interrupts every operation.
    pub fn kill_all_operations(&self) {
        self.kill_all.store(true, Ordering::SeqCst);
        tracing::info!(running = self.active_count(), "killing all operations");
    }

    /// Returns true once [`kill_all_operations`](Self::kill_all_operations) ran.
    #[must_use]
    pub fn kill_all_pending(&self) -> bool {
        self.kill_all.load(Ordering::SeqCst)
    }

    /// Returns the number of registered operations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.ops.lock().len()
    }

    /// Looks up a running operation.
    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<Arc<CurOp>> {
        self.ops.lock().get(&id).cloned()
    }
}

/// Settings of the interrupt fail point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptFailPointConfig {
    /// Connection whose operations are eligible.
    pub conn: u64,
    /// Probability of killing an eligible operation per check.
    pub chance: f64,
    /// Whether nested operations are eligible.
    pub allow_nested: bool,
}

/// Fault injection for interrupt checks. Disabled by default.
#[derive(Debug, Default)]
pub struct InterruptFailPoint {
    config: Mutex<Option<InterruptFailPointConfig>>,
}

impl InterruptFailPoint {
    /// Enables the fail point. `chance` is clamped to `[0, 1]`.
    pub fn enable(&self, mut config: InterruptFailPointConfig) {
        config.chance = config.chance.clamp(0.0, 1.0);
        tracing::warn!(conn = config.conn, chance = config.chance, "interrupt fail point enabled");
        *self.config.lock() = Some(config);
    }

    /// Disables the fail point.
    pub fn disable(&self) {
        *self.config.lock() = None;
    }

    /// Returns true if the fail point is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.lock().is_some()
    }

    /// Rolls the dice for an operation.
    #[must_use]
    pub fn should_fire(&self, op: &CurOp) -> bool {
        let Some(config) = *self.config.lock() else {
            return false;
        };
        if op.connection_id() != config.conn {
            return false;
        }
        if op.is_nested() && !config.allow_nested {
            return false;
        }
        rand::thread_rng().gen_bool(config.chance)
    }
}

/// Shared state of one running process.
pub struct ProcessContext {
    connection: Arc<EngineConnection>,
    registry: OperationRegistry,
    lock_manager: Arc<LockManager>,
    interrupt_fail_point: InterruptFailPoint,
}

impl ProcessContext {
    /// Builds the process context around an open connection.
    pub fn new(connection: Arc<EngineConnection>) -> Arc<Self> {
        let lock_manager = Arc::new(LockManager::for_engine(connection.supports_doc_locking()));
        Arc::new(Self {
            connection,
            registry: OperationRegistry::new(),
            lock_manager,
            interrupt_fail_point: InterruptFailPoint::default(),
        })
    }

    /// Returns the engine connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<EngineConnection> {
        &self.connection
    }

    /// Returns the active-operation registry.
    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Returns the interrupt fail point.
    #[must_use]
    pub fn interrupt_fail_point(&self) -> &InterruptFailPoint {
        &self.interrupt_fail_point
    }
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessContext")
            .field("active_ops", &self.registry.active_count())
            .field("kill_all", &self.registry.kill_all_pending())
            .field("granularity", &self.lock_manager.granularity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_increasing_across_threads() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<OperationId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all[0], OperationId(1));
    }

    #[test]
    fn register_and_kill() {
        let registry = OperationRegistry::new();
        let op = registry.register(7, false);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.kill_operation(op.id()));
        assert!(op.kill_pending());

        registry.unregister(op.id());
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.kill_operation(op.id()));
    }

    #[test]
    fn deadline_expiry() {
        let registry = OperationRegistry::new();
        let op = registry.register(1, false);
        assert!(!op.max_time_has_expired());
        op.set_max_time(Duration::ZERO);
        assert!(op.max_time_has_expired());
        op.clear_max_time();
        assert!(op.remaining_max_time().is_none());
    }

    #[test]
    fn unrepresentable_limit_is_no_limit() {
        let registry = OperationRegistry::new();
        let op = registry.register(1, false);
        op.set_max_time(Duration::MAX);
        assert!(!op.max_time_has_expired());
        assert!(op.remaining_max_time().is_none());

        op.set_max_time(Duration::from_secs(3600));
        assert!(op.remaining_max_time().is_some());
    }

    #[test]
    fn fail_point_eligibility() {
        let registry = OperationRegistry::new();
        let top = registry.register(5, false);
        let nested = registry.register(5, true);
        let other = registry.register(6, false);

        let fp = InterruptFailPoint::default();
        assert!(!fp.should_fire(&top));

        fp.enable(InterruptFailPointConfig {
            conn: 5,
            chance: 2.0,
            allow_nested: false,
        });
        assert!(fp.should_fire(&top));
        assert!(!fp.should_fire(&nested));
        assert!(!fp.should_fire(&other));

        fp.disable();
        assert!(!fp.is_enabled());
    }
}
