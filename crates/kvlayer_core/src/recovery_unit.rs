//! Per-operation transaction boundary.
//!
//! ## State Machine
//!
//! ```text
//! Inactive --begin(0->1)--> Active --commit(1->0)--> Inactive
//!                              |
//!                              +----end(1->0)------> Inactive (aborted)
//! ```
//!
//! Units of work nest. Only the outermost begin starts an engine transaction
//! and only the outermost commit or abort ends it. Nested levels just move
//! the depth counter. A nested abort marks the transaction rollback-only, so
//! the outermost commit aborts instead of silently committing.
//!
//! Registered [`Change`]s fire after the engine transaction resolves: commit
//! callbacks in registration order, rollback callbacks in reverse order.

use crate::error::{fatal, invariant, invariant_ok, CoreError, CoreResult};
use crate::session_pool::{PooledSession, SessionPool};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// A side effect that must follow the fate of a unit of work.
pub trait Change: Send {
    /// Called after the engine transaction committed.
    fn commit(&mut self);

    /// Called after the engine transaction rolled back.
    fn rollback(&mut self);
}

/// A [`Change`] built from closures.
///
/// ```rust
/// use kvlayer_core::FnChange;
///
/// let change = FnChange::new()
///     .on_commit(|| println!("committed"))
///     .on_rollback(|| println!("rolled back"));
/// # drop(change);
/// ```
#[derive(Default)]
pub struct FnChange {
    on_commit: Option<Box<dyn FnOnce() + Send>>,
    on_rollback: Option<Box<dyn FnOnce() + Send>>,
}

impl FnChange {
    /// Creates a change with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the commit callback.
    #[must_use]
    pub fn on_commit(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_commit = Some(Box::new(f));
        self
    }

    /// Sets the rollback callback.
    #[must_use]
    pub fn on_rollback(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_rollback = Some(Box::new(f));
        self
    }
}

impl Change for FnChange {
    fn commit(&mut self) {
        if let Some(f) = self.on_commit.take() {
            f();
        }
    }

    fn rollback(&mut self) {
        if let Some(f) = self.on_rollback.take() {
            f();
        }
    }
}

/// Diagnostic snapshot of a recovery unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryUnitState {
    /// Nesting depth.
    pub depth: u32,
    /// Whether an engine transaction is running.
    pub active: bool,
    /// Whether a nested abort doomed the transaction.
    pub rollback_only: bool,
    /// Whether the running transaction has written.
    pub ever_started_write: bool,
    /// Number of registered changes.
    pub changes: usize,
    /// Whether the unit is detached from its operation.
    pub parked: bool,
    /// Engine session held, if any.
    pub session_id: Option<u64>,
    /// Whether a caller announced it will await durability.
    pub await_commit_requested: bool,
    /// Age of the running transaction in milliseconds.
    pub txn_age_millis: Option<u64>,
}

/// Transaction scope of one operation.
pub struct RecoveryUnit {
    pool: Arc<SessionPool>,
    durable: bool,
    session: Option<PooledSession>,
    depth: u32,
    active: bool,
    rollback_only: bool,
    ever_started_write: bool,
    parked: bool,
    await_commit_requested: bool,
    txn_started: Option<Instant>,
    changes: Vec<Box<dyn Change>>,
}

impl RecoveryUnit {
    /// Creates an inactive recovery unit drawing sessions from `pool`.
    pub fn new(pool: Arc<SessionPool>, durable: bool) -> Self {
        Self {
            pool,
            durable,
            session: None,
            depth: 0,
            active: false,
            rollback_only: false,
            ever_started_write: false,
            parked: false,
            await_commit_requested: false,
            txn_started: None,
            changes: Vec::new(),
        }
    }

    /// Enters a unit of work, starting an engine transaction at depth 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses to start a transaction; the
    /// depth is left unchanged in that case.
    pub fn begin_unit_of_work(&mut self) -> CoreResult<()> {
        self.depth += 1;
        if self.depth == 1 {
            if let Err(err) = self.txn_open() {
                self.depth = 0;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Leaves a unit of work, committing at the outermost level.
    ///
    /// # Errors
    ///
    /// Returns `WriteConflict` if the engine rejected the commit, or
    /// `TransactionAborted` if a nested unit of work was aborted. Either way
    /// the transaction has been rolled back and rollback callbacks have run.
    pub fn commit_unit_of_work(&mut self) -> CoreResult<()> {
        invariant(self.depth > 0, "commit_unit_of_work without a unit of work");
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        if self.rollback_only {
            self.abort();
            return Err(CoreError::transaction_aborted(
                "a nested unit of work was aborted",
            ));
        }
        self.commit()
    }

    /// Leaves a unit of work without committing, aborting at the outermost level.
    pub fn end_unit_of_work(&mut self) {
        invariant(self.depth > 0, "end_unit_of_work without a unit of work");
        self.depth -= 1;
        if self.depth == 0 {
            self.abort();
        } else {
            self.rollback_only = true;
        }
    }

    /// Marks the running transaction rollback-only.
    ///
    /// The outermost commit will abort instead.
    pub fn set_rollback_only(&mut self) {
        if self.depth > 0 {
            self.rollback_only = true;
        }
    }

    /// Registers a change. Only valid inside a unit of work.
    pub fn register_change(&mut self, change: Box<dyn Change>) {
        invariant(self.depth > 0, "register_change outside a unit of work");
        self.changes.push(change);
    }

    /// Records that the running transaction has written.
    pub fn mark_write(&mut self) {
        self.ever_started_write = true;
    }

    /// Ends the current read snapshot outside any unit of work.
    ///
    /// The session goes back to the pool so the next access starts fresh.
    pub fn commit_and_restart(&mut self) {
        invariant(self.depth == 0, "commit_and_restart inside a unit of work");
        if !self.parked {
            self.release_session();
        }
    }

    /// Announces that the caller will call [`await_commit`](Self::await_commit).
    pub fn going_to_await_commit(&mut self) {
        self.await_commit_requested = true;
    }

    /// Waits until every commit so far is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot flush its journal.
    pub fn await_commit(&mut self) -> CoreResult<bool> {
        self.await_commit_requested = false;
        if !self.durable {
            return Ok(true);
        }
        match &mut self.session {
            Some(pooled) => pooled.session().log_flush()?,
            None => {
                let mut pooled = self.pool.checkout();
                let result = pooled.session().log_flush();
                self.pool.checkin(pooled);
                result?;
            }
        }
        Ok(true)
    }

    /// Detaches from the operation. The session stays parked on this unit.
    pub fn being_released_from_operation_context(&mut self) {
        self.parked = true;
        tracing::trace!(depth = self.depth, session = ?self.session_id(), "recovery unit parked");
    }

    /// Reattaches to an operation, resuming with the parked session.
    pub fn being_set_on_operation_context(&mut self) {
        self.parked = false;
    }

    /// Returns the held session, checking one out if needed.
    pub fn session(&mut self) -> &mut PooledSession {
        self.session.get_or_insert_with(|| self.pool.checkout())
    }

    /// Returns the id of the held session.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(PooledSession::id)
    }

    /// Returns the nesting depth.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Returns true while an engine transaction is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns true if the running transaction has written.
    #[must_use]
    pub fn ever_started_write(&self) -> bool {
        self.ever_started_write
    }

    /// Returns true while detached from an operation.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.parked
    }

    /// Returns the number of pending changes.
    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    /// Returns a diagnostic snapshot.
    #[must_use]
    pub fn report_state(&self) -> RecoveryUnitState {
        RecoveryUnitState {
            depth: self.depth,
            active: self.active,
            rollback_only: self.rollback_only,
            ever_started_write: self.ever_started_write,
            changes: self.changes.len(),
            parked: self.parked,
            session_id: self.session_id(),
            await_commit_requested: self.await_commit_requested,
            txn_age_millis: self
                .txn_started
                .map(|t| u64::try_from(t.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    fn txn_open(&mut self) -> CoreResult<()> {
        invariant(!self.active, "transaction already open");
        let pooled = self.session();
        pooled.session().begin_transaction("")?;
        pooled.cursors().set_in_transaction(true);
        self.active = true;
        self.rollback_only = false;
        self.txn_started = Some(Instant::now());
        Ok(())
    }

    fn commit(&mut self) -> CoreResult<()> {
        let result = match &mut self.session {
            Some(pooled) => {
                let result = pooled.session().commit_transaction();
                pooled.cursors().set_in_transaction(false);
                result
            }
            None => fatal("active transaction without a session"),
        };
        self.active = false;
        self.txn_started = None;
        self.ever_started_write = false;

        match result {
            Ok(()) => {
                for mut change in self.changes.drain(..) {
                    change.commit();
                }
                Ok(())
            }
            Err(err) => {
                let err = CoreError::from(err);
                if !err.is_write_conflict() {
                    fatal(format_args!("commit_transaction: {err}"));
                }
                tracing::debug!(error = %err, "commit lost a write conflict");
                self.run_rollbacks();
                Err(err)
            }
        }
    }

    fn abort(&mut self) {
        if self.active {
            if let Some(pooled) = &mut self.session {
                invariant_ok(pooled.session().rollback_transaction(), "rollback_transaction");
                pooled.cursors().set_in_transaction(false);
            }
        }
        self.active = false;
        self.txn_started = None;
        self.ever_started_write = false;
        self.rollback_only = false;
        self.run_rollbacks();
    }

    fn run_rollbacks(&mut self) {
        for mut change in self.changes.drain(..).rev() {
            change.rollback();
        }
    }

    fn release_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.checkin(session);
        }
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if self.depth > 0 || self.active {
            tracing::warn!(depth = self.depth, "recovery unit dropped inside a unit of work");
            self.depth = 0;
            self.abort();
        }
        self.release_session();
    }
}

impl std::fmt::Debug for RecoveryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryUnit")
            .field("state", &self.report_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlayer_storage::{InMemoryEngine, KvEngine};
    use parking_lot::Mutex;

    fn setup() -> (Arc<InMemoryEngine>, Arc<SessionPool>) {
        let engine = Arc::new(InMemoryEngine::open(None, "create").unwrap());
        engine
            .open_session()
            .unwrap()
            .create("table:t", "")
            .unwrap();
        let pool = Arc::new(SessionPool::new(engine.clone(), 16));
        (engine, pool)
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Box<dyn Change> {
        let (c, r) = (Arc::clone(log), Arc::clone(log));
        let (cn, rn) = (format!("commit {name}"), format!("rollback {name}"));
        Box::new(
            FnChange::new()
                .on_commit(move || c.lock().push(cn))
                .on_rollback(move || r.lock().push(rn)),
        )
    }

    fn write(ru: &mut RecoveryUnit, key: &[u8]) {
        let mut cursor = ru.session().session().open_cursor("table:t").unwrap();
        cursor.insert(key, b"v", true).unwrap();
        ru.mark_write();
    }

    fn read(pool: &SessionPool, key: &[u8]) -> Option<Vec<u8>> {
        let mut session = pool.standalone_session().unwrap();
        let mut cursor = session.open_cursor("table:t").unwrap();
        cursor.search(key).unwrap()
    }

    #[test]
    fn nested_units_share_one_transaction() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);

        ru.begin_unit_of_work().unwrap();
        ru.begin_unit_of_work().unwrap();
        assert_eq!(ru.depth(), 2);
        write(&mut ru, b"a");
        ru.commit_unit_of_work().unwrap();

        assert!(ru.is_active());
        assert_eq!(read(&pool, b"a"), None);

        ru.commit_unit_of_work().unwrap();
        assert!(!ru.is_active());
        assert_eq!(read(&pool, b"a"), Some(b"v".to_vec()));
    }

    #[test]
    fn commit_fires_in_order_rollback_in_reverse() {
        let (_engine, pool) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ru = RecoveryUnit::new(pool, false);

        ru.begin_unit_of_work().unwrap();
        ru.register_change(recording(&log, "1"));
        ru.register_change(recording(&log, "2"));
        ru.commit_unit_of_work().unwrap();
        assert_eq!(ru.pending_changes(), 0);

        ru.begin_unit_of_work().unwrap();
        ru.register_change(recording(&log, "3"));
        ru.register_change(recording(&log, "4"));
        ru.end_unit_of_work();
        assert_eq!(ru.pending_changes(), 0);

        assert_eq!(
            *log.lock(),
            vec!["commit 1", "commit 2", "rollback 4", "rollback 3"]
        );
    }

    #[test]
    fn abort_discards_writes() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        ru.begin_unit_of_work().unwrap();
        write(&mut ru, b"a");
        assert!(ru.ever_started_write());
        ru.end_unit_of_work();
        assert!(!ru.ever_started_write());
        assert_eq!(read(&pool, b"a"), None);
    }

    #[test]
    fn nested_abort_dooms_outer_commit() {
        let (_engine, pool) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);

        ru.begin_unit_of_work().unwrap();
        write(&mut ru, b"a");
        ru.register_change(recording(&log, "outer"));
        ru.begin_unit_of_work().unwrap();
        ru.end_unit_of_work();
        assert!(ru.report_state().rollback_only);

        let err = ru.commit_unit_of_work().unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
        assert_eq!(read(&pool, b"a"), None);
        assert_eq!(*log.lock(), vec!["rollback outer"]);
    }

    #[test]
    fn write_conflict_rolls_back_changes() {
        let (_engine, pool) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut first = RecoveryUnit::new(Arc::clone(&pool), false);
        let mut second = RecoveryUnit::new(Arc::clone(&pool), false);

        first.begin_unit_of_work().unwrap();
        second.begin_unit_of_work().unwrap();
        write(&mut first, b"k");
        write(&mut second, b"k");
        second.register_change(recording(&log, "second"));

        first.commit_unit_of_work().unwrap();
        let err = second.commit_unit_of_work().unwrap_err();
        assert!(err.is_write_conflict());
        assert!(!second.is_active());
        assert_eq!(*log.lock(), vec!["rollback second"]);
    }

    #[test]
    #[should_panic(expected = "register_change outside a unit of work")]
    fn register_change_requires_unit_of_work() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(pool, false);
        ru.register_change(Box::new(FnChange::new()));
    }

    #[test]
    fn parked_session_survives_detach() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        ru.begin_unit_of_work().unwrap();
        let id = ru.session_id();
        ru.being_released_from_operation_context();
        assert!(ru.is_parked());
        assert_eq!(pool.idle_count(), 0);

        ru.being_set_on_operation_context();
        assert_eq!(ru.session_id(), id);
        assert!(ru.is_active());
        ru.commit_unit_of_work().unwrap();
    }

    #[test]
    fn commit_and_restart_returns_session() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        ru.session();
        assert!(ru.session_id().is_some());
        ru.commit_and_restart();
        assert!(ru.session_id().is_none());
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn drop_inside_unit_of_work_aborts() {
        let (_engine, pool) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
            ru.begin_unit_of_work().unwrap();
            write(&mut ru, b"a");
            ru.register_change(recording(&log, "x"));
        }
        assert_eq!(*log.lock(), vec!["rollback x"]);
        assert_eq!(read(&pool, b"a"), None);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn report_state_serializes() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(pool, false);
        ru.begin_unit_of_work().unwrap();
        ru.going_to_await_commit();
        let json = serde_json::to_value(ru.report_state()).unwrap();
        assert_eq!(json["depth"], 1);
        assert_eq!(json["active"], true);
        assert_eq!(json["await_commit_requested"], true);
        ru.commit_unit_of_work().unwrap();
        assert!(ru.await_commit().unwrap());
    }
}
