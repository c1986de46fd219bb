//! Cursor handles and the per-session cursor cache.

use crate::error::CoreResult;
use crate::recovery_unit::RecoveryUnit;
use kvlayer_storage::KvCursor;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Idle cursors owned by one session, keyed by resource name.
///
/// Every cached cursor keeps its table referenced in the engine, so a cache
/// whose session epoch has gone stale drops its cursors instead of keeping
/// them. While the session has a transaction open the cursors stay, so a
/// queued drop cannot remove a table the transaction still writes to.
pub struct CursorCache {
    cursors: Mutex<Vec<Box<dyn KvCursor>>>,
    epoch: u64,
    pool_epoch: Arc<AtomicU64>,
    closed: AtomicBool,
    in_txn: AtomicBool,
}

impl CursorCache {
    pub(crate) fn new(epoch: u64, pool_epoch: Arc<AtomicU64>) -> Self {
        Self {
            cursors: Mutex::new(Vec::new()),
            epoch,
            pool_epoch,
            closed: AtomicBool::new(false),
            in_txn: AtomicBool::new(false),
        }
    }

    fn is_stale(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return true;
        }
        !self.in_txn.load(Ordering::SeqCst) && self.epoch < self.pool_epoch.load(Ordering::SeqCst)
    }

    /// Records whether the owning session has a transaction open. Ending the
    /// transaction releases the cursors of a stale cache.
    pub(crate) fn set_in_transaction(&self, open: bool) {
        self.in_txn.store(open, Ordering::SeqCst);
        if !open {
            let mut cursors = self.cursors.lock();
            if self.is_stale() {
                cursors.clear();
            }
        }
    }

    /// Takes a cached cursor for `uri`, reset to unpositioned.
    pub(crate) fn take(&self, uri: &str) -> Option<Box<dyn KvCursor>> {
        let mut cursors = self.cursors.lock();
        if self.is_stale() {
            cursors.clear();
            return None;
        }
        let pos = cursors.iter().position(|c| c.uri() == uri)?;
        let mut cursor = cursors.swap_remove(pos);
        cursor.reset();
        Some(cursor)
    }

    /// Returns a cursor to the cache.
    pub(crate) fn give_back(&self, mut cursor: Box<dyn KvCursor>) {
        let mut cursors = self.cursors.lock();
        if self.is_stale() {
            cursors.clear();
            return;
        }
        cursor.reset();
        cursors.push(cursor);
    }

    /// Unpositions every cached cursor.
    pub(crate) fn reset_all(&self) {
        for cursor in self.cursors.lock().iter_mut() {
            cursor.reset();
        }
    }

    /// Drops every cached cursor and refuses new ones.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cursors.lock().clear();
    }

    /// Returns the number of cached cursors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    /// Returns true if no cursors are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An engine cursor borrowed from the recovery unit's session.
///
/// Dropping the handle returns the cursor to its session's cache, on every
/// exit path.
pub struct CursorHandle {
    cursor: Option<Box<dyn KvCursor>>,
    cache: Arc<CursorCache>,
    session_id: u64,
}

impl CursorHandle {
    /// Binds a cursor on `uri` to the recovery unit's current session,
    /// reusing a cached one when possible.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist.
    pub fn new(ru: &mut RecoveryUnit, uri: &str) -> CoreResult<Self> {
        let pooled = ru.session();
        let cache = Arc::clone(pooled.cursors());
        let session_id = pooled.id();
        let cursor = match cache.take(uri) {
            Some(cursor) => cursor,
            None => pooled.session().open_cursor(uri)?,
        };
        Ok(Self {
            cursor: Some(cursor),
            cache,
            session_id,
        })
    }

    /// Returns the positioned cursor.
    pub fn get(&mut self) -> &mut dyn KvCursor {
        self.deref_mut()
    }

    /// Returns the id of the session this cursor belongs to.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

impl Deref for CursorHandle {
    type Target = dyn KvCursor;

    fn deref(&self) -> &Self::Target {
        match &self.cursor {
            Some(cursor) => cursor.as_ref(),
            None => unreachable!("cursor is only taken on drop"),
        }
    }
}

impl DerefMut for CursorHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.cursor {
            Some(cursor) => cursor.as_mut(),
            None => unreachable!("cursor is only taken on drop"),
        }
    }
}

impl Drop for CursorHandle {
    fn drop(&mut self) {
        if let Some(cursor) = self.cursor.take() {
            self.cache.give_back(cursor);
        }
    }
}

impl std::fmt::Debug for CursorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorHandle")
            .field("uri", &self.uri())
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_pool::SessionPool;
    use kvlayer_storage::{InMemoryEngine, KvEngine};

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

    #[test]
    fn handle_returns_cursor_to_cache() {
        let (engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        {
            let mut handle = CursorHandle::new(&mut ru, "table:t").unwrap();
            handle.insert(b"k", b"v", true).unwrap();
        }
        assert_eq!(ru.session().cursors().len(), 1);
        assert_eq!(engine.cursor_refs("table:t"), 1);

        let mut handle = CursorHandle::new(&mut ru, "table:t").unwrap();
        assert_eq!(handle.key(), None);
        assert_eq!(handle.get().search(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(ru.session().cursors().is_empty());
    }

    #[test]
    fn stale_cache_drops_returned_cursor() {
        let (engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        let handle = CursorHandle::new(&mut ru, "table:t").unwrap();
        pool.bump_epoch();
        drop(handle);
        assert_eq!(engine.cursor_refs("table:t"), 0);
    }

    #[test]
    fn stale_cache_holds_cursors_until_transaction_ends() {
        let (engine, pool) = setup();
        let mut ru = RecoveryUnit::new(Arc::clone(&pool), false);
        ru.begin_unit_of_work().unwrap();
        CursorHandle::new(&mut ru, "table:t")
            .unwrap()
            .insert(b"k", b"v", true)
            .unwrap();

        pool.bump_epoch();
        CursorHandle::new(&mut ru, "table:t")
            .unwrap()
            .insert(b"k2", b"v", true)
            .unwrap();
        assert_eq!(engine.cursor_refs("table:t"), 1);

        ru.commit_unit_of_work().unwrap();
        assert_eq!(engine.cursor_refs("table:t"), 0);
    }

    #[test]
    fn missing_table_fails() {
        let (_engine, pool) = setup();
        let mut ru = RecoveryUnit::new(pool, false);
        let err = CursorHandle::new(&mut ru, "table:missing").unwrap_err();
        assert!(err.is_not_found());
    }
}
