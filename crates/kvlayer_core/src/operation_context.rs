//! Per-operation execution context.
//!
//! An [`OperationContext`] couples one [`RecoveryUnit`] with one [`Locker`]
//! and carries the operation's kill and deadline state. It is registered with
//! the process-wide [`OperationRegistry`](crate::OperationRegistry) for its
//! whole lifetime.
//!
//! ## Interrupt Checks
//!
//! Interruption is cooperative. [`OperationContext::check_for_interrupt`]
//! evaluates, in order: the process-wide shutdown flag, the operation's
//! deadline, the interrupt fail point and the operation's kill flag. An
//! interrupted check dooms the running unit of work so it can only abort.

use crate::error::{fatal, CoreError, CoreResult};
use crate::lock::{LockMode, Locker, LockerImpl};
use crate::process::{CurOp, ProcessContext};
use crate::recovery_unit::RecoveryUnit;
use crate::types::OperationId;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

/// Why an operation was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// Every operation is being killed for shutdown.
    Shutdown,
    /// The operation ran past its deadline.
    TimeLimit,
    /// The operation was killed.
    Killed,
}

impl InterruptReason {
    /// Returns the matching error.
    #[must_use]
    pub fn into_error(self) -> CoreError {
        match self {
            Self::Shutdown => CoreError::InterruptedAtShutdown,
            Self::TimeLimit => CoreError::ExceededTimeLimit,
            Self::Killed => CoreError::Interrupted,
        }
    }
}

/// Execution context of one logical operation.
pub struct OperationContext {
    process: Arc<ProcessContext>,
    curop: Arc<CurOp>,
    recovery_unit: Option<RecoveryUnit>,
    locker: Box<dyn Locker>,
}

impl OperationContext {
    /// Creates a top-level operation for a client connection.
    pub fn new(process: Arc<ProcessContext>, connection_id: u64) -> Self {
        Self::build(process, connection_id, false)
    }

    /// Creates an operation running on behalf of another one.
    pub fn new_nested(process: Arc<ProcessContext>, connection_id: u64) -> Self {
        Self::build(process, connection_id, true)
    }

    fn build(process: Arc<ProcessContext>, connection_id: u64, nested: bool) -> Self {
        let curop = process.registry().register(connection_id, nested);
        let recovery_unit = process.connection().new_recovery_unit();
        let locker = Box::new(LockerImpl::new(Arc::clone(process.lock_manager())));
        tracing::trace!(op = %curop.id(), connection_id, nested, "operation started");
        Self {
            process,
            curop,
            recovery_unit: Some(recovery_unit),
            locker,
        }
    }

    /// Returns the operation id.
    #[must_use]
    pub fn op_id(&self) -> OperationId {
        self.curop.id()
    }

    /// Returns the client connection id.
    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.curop.connection_id()
    }

    /// Returns the kill and deadline state.
    #[must_use]
    pub fn curop(&self) -> &Arc<CurOp> {
        &self.curop
    }

    /// Returns the process context.
    #[must_use]
    pub fn process(&self) -> &Arc<ProcessContext> {
        &self.process
    }

    /// Returns the recovery unit.
    pub fn recovery_unit(&mut self) -> &mut RecoveryUnit {
        match &mut self.recovery_unit {
            Some(ru) => ru,
            None => fatal("operation context has no recovery unit"),
        }
    }

    /// Detaches the recovery unit, leaving a fresh one in its place.
    ///
    /// The detached unit keeps its session and transaction parked until it
    /// is reattached with [`set_recovery_unit`](Self::set_recovery_unit).
    pub fn release_recovery_unit(&mut self) -> RecoveryUnit {
        let fresh = self.process.connection().new_recovery_unit();
        let mut released = match self.recovery_unit.replace(fresh) {
            Some(ru) => ru,
            None => fatal("operation context has no recovery unit"),
        };
        released.being_released_from_operation_context();
        released
    }

    /// Installs a recovery unit, returning the one it replaces.
    pub fn set_recovery_unit(&mut self, mut ru: RecoveryUnit) -> Option<RecoveryUnit> {
        ru.being_set_on_operation_context();
        self.recovery_unit.replace(ru)
    }

    /// Returns the locker.
    #[must_use]
    pub fn locker(&self) -> &dyn Locker {
        self.locker.as_ref()
    }

    /// Returns the locker for acquiring or releasing locks.
    pub fn locker_mut(&mut self) -> &mut dyn Locker {
        self.locker.as_mut()
    }

    /// Acquires the global lock in `mode`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is not granted within `timeout`.
    pub fn lock_global(&mut self, mode: LockMode, timeout: Duration) -> CoreResult<()> {
        self.locker.lock_global(mode, timeout)
    }

    /// Releases one acquisition of the global lock.
    pub fn unlock_global(&mut self) {
        self.locker.unlock_global();
    }

    /// Records that this operation wrote.
    pub fn write_happened(&mut self) {
        self.recovery_unit().mark_write();
        self.locker.write_happened();
    }

    /// Sets the operation's time limit, measured from now.
    pub fn set_max_time(&self, limit: Duration) {
        self.curop.set_max_time(limit);
    }

    /// Checks whether the operation must stop.
    ///
    /// With `heed_mutex`, an operation that holds a write lock and has
    /// written since the last checkpoint is never interrupted. Otherwise an
    /// interruption marks the running unit of work rollback-only.
    ///
    /// # Errors
    ///
    /// Returns `InterruptedAtShutdown`, `ExceededTimeLimit` or `Interrupted`.
    pub fn check_for_interrupt(&mut self, heed_mutex: bool) -> CoreResult<()> {
        if heed_mutex && self.locker.is_write_locked() && self.locker.has_written_since_checkpoint()
        {
            return Ok(());
        }
        match self.check_for_interrupt_no_assert() {
            None => Ok(()),
            Some(reason) => {
                tracing::debug!(op = %self.op_id(), ?reason, "operation interrupted");
                self.recovery_unit().set_rollback_only();
                Err(reason.into_error())
            }
        }
    }

    /// Runs the interrupt checks without signalling.
    ///
    /// Shares the side effects of [`check_for_interrupt`](Self::check_for_interrupt):
    /// an expired deadline or a firing fail point marks the operation killed.
    #[must_use]
    pub fn check_for_interrupt_no_assert(&self) -> Option<InterruptReason> {
        if self.process.registry().kill_all_pending() {
            return Some(InterruptReason::Shutdown);
        }
        if self.curop.max_time_has_expired() {
            self.curop.kill();
            return Some(InterruptReason::TimeLimit);
        }
        if self.process.interrupt_fail_point().should_fire(&self.curop) {
            tracing::info!(op = %self.op_id(), "interrupt fail point fired");
            self.curop.kill();
        }
        if self.curop.kill_pending() {
            return Some(InterruptReason::Killed);
        }
        None
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        // The recovery unit goes first so its session is back in the pool
        // before the operation leaves the registry.
        drop(self.recovery_unit.take());
        self.process.registry().unregister(self.curop.id());
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("op", &self.curop.id())
            .field("connection_id", &self.curop.connection_id())
            .field("lock_mode", &self.locker.mode())
            .field("recovery_unit", &self.recovery_unit)
            .finish()
    }
}

/// RAII guard around one unit of work.
///
/// Begins on construction. [`commit`](Self::commit) commits; dropping the
/// guard without committing aborts. The guard dereferences to the operation
/// context so work can be done through it.
///
/// ```rust
/// use kvlayer_core::{
///     EngineConnection, EngineOptions, OperationContext, ProcessContext, WriteUnitOfWork,
/// };
/// use std::sync::Arc;
///
/// let options = EngineOptions::new().cache_size_gb(1);
/// let conn = Arc::new(EngineConnection::open_in_memory(options).unwrap());
/// let process = ProcessContext::new(conn);
/// let mut opctx = OperationContext::new(process, 1);
///
/// let wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
/// assert_eq!(wuow.recovery_unit_depth(), 1);
/// wuow.commit().unwrap();
/// ```
pub struct WriteUnitOfWork<'a> {
    opctx: &'a mut OperationContext,
    ended: bool,
}

impl<'a> WriteUnitOfWork<'a> {
    /// Begins a unit of work.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses to start a transaction.
    pub fn new(opctx: &'a mut OperationContext) -> CoreResult<Self> {
        opctx.recovery_unit().begin_unit_of_work()?;
        Ok(Self {
            opctx,
            ended: false,
        })
    }

    /// Returns the current nesting depth.
    #[must_use]
    pub fn recovery_unit_depth(&self) -> u32 {
        self.opctx.recovery_unit.as_ref().map_or(0, RecoveryUnit::depth)
    }

    /// Commits the unit of work.
    ///
    /// # Errors
    ///
    /// Returns `WriteConflict` or `TransactionAborted` if the outermost
    /// commit had to roll back instead.
    pub fn commit(mut self) -> CoreResult<()> {
        self.ended = true;
        let result = self.opctx.recovery_unit().commit_unit_of_work();
        self.after_end();
        result
    }

    fn after_end(&mut self) {
        if self.opctx.recovery_unit().depth() == 0 {
            self.opctx.locker.checkpoint_happened();
        }
    }
}

impl Deref for WriteUnitOfWork<'_> {
    type Target = OperationContext;

    fn deref(&self) -> &Self::Target {
        self.opctx
    }
}

impl DerefMut for WriteUnitOfWork<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.opctx
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.ended {
            self.opctx.recovery_unit().end_unit_of_work();
            self.after_end();
        }
    }
}
