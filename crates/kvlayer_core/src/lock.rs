//! Lock-manager contract consumed by operation contexts.
//!
//! Only the acquire/release surface matters to this crate. [`LockManager`]
//! is a single global resource with multi-granularity modes, which is enough
//! to drive interrupt suppression and write-lock checks.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Not locked.
    None,
    /// Intent to read at a finer granularity.
    IntentShared,
    /// Intent to write at a finer granularity.
    IntentExclusive,
    /// Shared read lock.
    Shared,
    /// Exclusive write lock.
    Exclusive,
}

impl LockMode {
    const fn slot(self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::IntentShared => Some(0),
            Self::IntentExclusive => Some(1),
            Self::Shared => Some(2),
            Self::Exclusive => Some(3),
        }
    }

    /// Returns true if two holders may hold these modes at once.
    #[must_use]
    pub const fn is_compatible_with(self, other: Self) -> bool {
        use LockMode::{Exclusive, IntentExclusive, IntentShared, None, Shared};
        match (self, other) {
            (None, _) | (_, None) => true,
            (Exclusive, _) | (_, Exclusive) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) | (Shared, Shared) => true,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => false,
        }
    }

    /// Returns true if holding `self` already grants `other`.
    #[must_use]
    pub fn covers(self, other: Self) -> bool {
        match (self, other) {
            (_, Self::None) => true,
            (Self::Exclusive, _) => true,
            (Self::Shared, Self::IntentShared) => true,
            (Self::IntentExclusive, Self::IntentShared) => true,
            (held, wanted) => held == wanted,
        }
    }

    /// Returns true for modes that permit writing.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::IntentExclusive | Self::Exclusive)
    }
}

/// Granularity at which writers lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGranularity {
    /// The engine isolates documents itself; writers take intent locks.
    Document,
    /// Writers take the global lock exclusively.
    Global,
}

/// Per-operation handle onto the lock manager.
pub trait Locker: Send {
    /// Acquires the global lock in `mode`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is not granted in time.
    fn lock_global(&mut self, mode: LockMode, timeout: Duration) -> CoreResult<()>;

    /// Releases one acquisition of the global lock.
    fn unlock_global(&mut self);

    /// Returns the mode currently held.
    fn mode(&self) -> LockMode;

    /// Returns true while a write-capable mode is held.
    fn is_write_locked(&self) -> bool {
        self.mode().is_write()
    }

    /// Returns true if a write happened since the last checkpoint.
    fn has_written_since_checkpoint(&self) -> bool;

    /// Records a write.
    fn write_happened(&mut self);

    /// Clears the written flag.
    fn checkpoint_happened(&mut self);
}

#[derive(Debug, Default)]
struct Granted {
    counts: [usize; 4],
}

impl Granted {
    fn admits(&self, mode: LockMode) -> bool {
        [
            LockMode::IntentShared,
            LockMode::IntentExclusive,
            LockMode::Shared,
            LockMode::Exclusive,
        ]
        .into_iter()
        .filter(|held| held.slot().is_some_and(|s| self.counts[s] > 0))
        .all(|held| held.is_compatible_with(mode))
    }
}

/// Process-wide lock table.
#[derive(Debug)]
pub struct LockManager {
    granted: Mutex<Granted>,
    released: Condvar,
    granularity: LockGranularity,
}

impl LockManager {
    /// Creates a lock manager.
    #[must_use]
    pub fn new(granularity: LockGranularity) -> Self {
        Self {
            granted: Mutex::new(Granted::default()),
            released: Condvar::new(),
            granularity,
        }
    }

    /// Creates a lock manager matching the engine's isolation capability.
    #[must_use]
    pub fn for_engine(supports_doc_locking: bool) -> Self {
        Self::new(if supports_doc_locking {
            LockGranularity::Document
        } else {
            LockGranularity::Global
        })
    }

    /// Returns the granularity writers lock at.
    #[must_use]
    pub fn granularity(&self) -> LockGranularity {
        self.granularity
    }

    /// Returns the global mode a writer should request.
    #[must_use]
    pub fn write_mode(&self) -> LockMode {
        match self.granularity {
            LockGranularity::Document => LockMode::IntentExclusive,
            LockGranularity::Global => LockMode::Exclusive,
        }
    }

    /// Returns the global mode a reader should request.
    #[must_use]
    pub fn read_mode(&self) -> LockMode {
        match self.granularity {
            LockGranularity::Document => LockMode::IntentShared,
            LockGranularity::Global => LockMode::Shared,
        }
    }

    fn acquire(&self, mode: LockMode, timeout: Duration) -> CoreResult<()> {
        let Some(slot) = mode.slot() else {
            return Ok(());
        };
        let deadline = Instant::now().checked_add(timeout);
        let mut granted = self.granted.lock();
        while !granted.admits(mode) {
            let Some(deadline) = deadline else {
                self.released.wait(&mut granted);
                continue;
            };
            let timed_out = self.released.wait_until(&mut granted, deadline).timed_out();
            if timed_out && !granted.admits(mode) {
                return Err(CoreError::LockTimeout {
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        granted.counts[slot] += 1;
        Ok(())
    }

    fn release(&self, mode: LockMode) {
        if let Some(slot) = mode.slot() {
            let mut granted = self.granted.lock();
            granted.counts[slot] = granted.counts[slot].saturating_sub(1);
            drop(granted);
            self.released.notify_all();
        }
    }
}

/// The default [`Locker`]. Acquisitions nest; releasing the outermost one
/// gives the lock back.
#[derive(Debug)]
pub struct LockerImpl {
    manager: Arc<LockManager>,
    mode: LockMode,
    recursion: u32,
    written: bool,
}

impl LockerImpl {
    /// Creates an unlocked locker.
    #[must_use]
    pub fn new(manager: Arc<LockManager>) -> Self {
        Self {
            manager,
            mode: LockMode::None,
            recursion: 0,
            written: false,
        }
    }
}

impl Locker for LockerImpl {
    fn lock_global(&mut self, mode: LockMode, timeout: Duration) -> CoreResult<()> {
        if self.recursion > 0 {
            if !self.mode.covers(mode) {
                return Err(CoreError::invalid_operation(format!(
                    "cannot upgrade {:?} to {mode:?}",
                    self.mode
                )));
            }
            self.recursion += 1;
            return Ok(());
        }
        self.manager.acquire(mode, timeout)?;
        self.mode = mode;
        self.recursion = 1;
        Ok(())
    }

    fn unlock_global(&mut self) {
        if self.recursion == 0 {
            return;
        }
        self.recursion -= 1;
        if self.recursion == 0 {
            self.manager.release(self.mode);
            self.mode = LockMode::None;
        }
    }

    fn mode(&self) -> LockMode {
        self.mode
    }

    fn has_written_since_checkpoint(&self) -> bool {
        self.written
    }

    fn write_happened(&mut self) {
        self.written = true;
    }

    fn checkpoint_happened(&mut self) {
        self.written = false;
    }
}

impl Drop for LockerImpl {
    fn drop(&mut self) {
        if self.recursion > 0 {
            self.manager.release(self.mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LockManager> {
        Arc::new(LockManager::new(LockGranularity::Global))
    }

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(IntentShared.is_compatible_with(IntentExclusive));
        assert!(IntentExclusive.is_compatible_with(IntentExclusive));
        assert!(Shared.is_compatible_with(Shared));
        assert!(!Shared.is_compatible_with(IntentExclusive));
        assert!(!Exclusive.is_compatible_with(IntentShared));
    }

    #[test]
    fn shared_holders_coexist() {
        let manager = manager();
        let mut a = LockerImpl::new(Arc::clone(&manager));
        let mut b = LockerImpl::new(Arc::clone(&manager));
        a.lock_global(LockMode::Shared, Duration::from_millis(10)).unwrap();
        b.lock_global(LockMode::Shared, Duration::from_millis(10)).unwrap();
        assert!(!a.is_write_locked());
    }

    #[test]
    fn exclusive_times_out_behind_reader() {
        let manager = manager();
        let mut reader = LockerImpl::new(Arc::clone(&manager));
        let mut writer = LockerImpl::new(Arc::clone(&manager));
        reader.lock_global(LockMode::Shared, Duration::from_millis(10)).unwrap();

        let err = writer
            .lock_global(LockMode::Exclusive, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { millis: 20 }));

        reader.unlock_global();
        writer.lock_global(LockMode::Exclusive, Duration::from_millis(10)).unwrap();
        assert!(writer.is_write_locked());
    }

    #[test]
    fn release_wakes_waiter() {
        let manager = manager();
        let mut holder = LockerImpl::new(Arc::clone(&manager));
        holder.lock_global(LockMode::Exclusive, Duration::from_millis(10)).unwrap();

        let waiter_manager = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            let mut locker = LockerImpl::new(waiter_manager);
            locker.lock_global(LockMode::Shared, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        holder.unlock_global();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn unbounded_timeout_waits_for_release() {
        let manager = manager();
        let mut locker = LockerImpl::new(Arc::clone(&manager));
        locker.lock_global(LockMode::Shared, Duration::MAX).unwrap();
        assert_eq!(locker.mode(), LockMode::Shared);

        let waiter_manager = Arc::clone(&manager);
        let waiter = std::thread::spawn(move || {
            let mut writer = LockerImpl::new(waiter_manager);
            writer.lock_global(LockMode::Exclusive, Duration::MAX)?;
            Ok::<_, CoreError>(writer.is_write_locked())
        });
        std::thread::sleep(Duration::from_millis(20));
        locker.unlock_global();
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn recursion_and_upgrade() {
        let manager = manager();
        let mut locker = LockerImpl::new(Arc::clone(&manager));
        locker.lock_global(LockMode::Exclusive, Duration::ZERO).unwrap();
        locker.lock_global(LockMode::Shared, Duration::ZERO).unwrap();
        locker.unlock_global();
        assert_eq!(locker.mode(), LockMode::Exclusive);
        locker.unlock_global();
        assert_eq!(locker.mode(), LockMode::None);

        locker.lock_global(LockMode::Shared, Duration::ZERO).unwrap();
        assert!(locker.lock_global(LockMode::Exclusive, Duration::ZERO).is_err());
    }

    #[test]
    fn written_flag() {
        let mut locker = LockerImpl::new(manager());
        assert!(!locker.has_written_since_checkpoint());
        locker.write_happened();
        assert!(locker.has_written_since_checkpoint());
        locker.checkpoint_happened();
        assert!(!locker.has_written_since_checkpoint());
    }

    #[test]
    fn granularity_selects_write_mode() {
        assert_eq!(LockManager::for_engine(true).write_mode(), LockMode::IntentExclusive);
        assert_eq!(LockManager::for_engine(false).write_mode(), LockMode::Exclusive);
        assert_eq!(LockManager::for_engine(true).read_mode(), LockMode::IntentShared);
    }

    #[test]
    fn dropped_locker_releases() {
        let manager = manager();
        {
            let mut locker = LockerImpl::new(Arc::clone(&manager));
            locker.lock_global(LockMode::Exclusive, Duration::ZERO).unwrap();
        }
        let mut other = LockerImpl::new(manager);
        other.lock_global(LockMode::Exclusive, Duration::ZERO).unwrap();
    }
}
