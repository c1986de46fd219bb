//! Pool of reusable engine sessions.
//!
//! Opening a session is expensive, so recovery units check sessions out of
//! this pool and check them back in when their work is done.
//!
//! ## Epochs
//!
//! Each pooled session remembers the pool epoch it was opened in. When a
//! drop is deferred because cursors still reference the table, the epoch is
//! advanced and every idle session is closed. Sessions that were checked out
//! at that moment are closed on checkin instead of being reused, which
//! releases the cursors they cached.

use crate::cursor::CursorCache;
use crate::error::{fatal, invariant_ok, CoreResult};
use kvlayer_storage::{KvEngine, KvSession};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A session owned by the pool or by exactly one recovery unit.
pub struct PooledSession {
    session: Box<dyn KvSession>,
    cursors: Arc<CursorCache>,
    epoch: u64,
}

impl PooledSession {
    /// Returns the engine session.
    pub fn session(&mut self) -> &mut dyn KvSession {
        self.session.as_mut()
    }

    /// Returns the cursors cached on this session.
    #[must_use]
    pub fn cursors(&self) -> &Arc<CursorCache> {
        &self.cursors
    }

    /// Returns the engine session id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    /// Returns the pool epoch this session was opened in.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn close(self) {
        self.cursors.close();
        drop(self.session);
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id())
            .field("epoch", &self.epoch)
            .field("cached_cursors", &self.cursors.len())
            .finish()
    }
}

/// Bounded pool of engine sessions.
pub struct SessionPool {
    engine: Arc<dyn KvEngine>,
    idle: Mutex<Vec<PooledSession>>,
    epoch: Arc<AtomicU64>,
    session_max: usize,
    open: AtomicUsize,
}

impl SessionPool {
    /// Creates an empty pool.
    pub fn new(engine: Arc<dyn KvEngine>, session_max: usize) -> Self {
        Self {
            engine,
            idle: Mutex::new(Vec::new()),
            epoch: Arc::new(AtomicU64::new(0)),
            session_max,
            open: AtomicUsize::new(0),
        }
    }

    /// Returns an idle session, opening a new one if none is idle.
    ///
    /// Exceeding `session_max` open sessions is fatal.
    pub fn checkout(&self) -> PooledSession {
        if let Some(session) = self.idle.lock().pop() {
            return session;
        }

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        if open > self.session_max {
            self.open.fetch_sub(1, Ordering::SeqCst);
            fatal(format_args!(
                "session pool exhausted: {} sessions open (session_max={})",
                open - 1,
                self.session_max
            ));
        }

        let session = invariant_ok(self.engine.open_session(), "open session");
        let epoch = self.epoch.load(Ordering::SeqCst);
        tracing::trace!(session = session.id(), epoch, "opened pooled session");
        PooledSession {
            session,
            cursors: Arc::new(CursorCache::new(epoch, Arc::clone(&self.epoch))),
            epoch,
        }
    }

    /// Returns a session to the idle set, or closes it if its epoch is stale.
    pub fn checkin(&self, mut session: PooledSession) {
        if session.session.in_transaction() {
            fatal(format_args!(
                "session {} checked in with a running transaction",
                session.id()
            ));
        }
        if session.epoch < self.epoch.load(Ordering::SeqCst) {
            tracing::debug!(session = session.id(), "closing session from a stale epoch");
            self.release(session);
            return;
        }
        session.cursors.reset_all();
        self.idle.lock().push(session);
    }

    /// Force-closes every idle session. Checked-out sessions are unaffected.
    pub fn close_all(&self) -> usize {
        let sessions = std::mem::take(&mut *self.idle.lock());
        let closed = sessions.len();
        for session in sessions {
            self.release(session);
        }
        if closed > 0 {
            tracing::debug!(closed, "closed idle sessions");
        }
        closed
    }

    /// Advances the epoch, returning the new value.
    pub fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Returns the number of idle sessions.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Returns the number of sessions this pool has open, idle or checked out.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Opens a session outside the pool for one-off administrative work.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses to open a session.
    pub fn standalone_session(&self) -> CoreResult<Box<dyn KvSession>> {
        Ok(self.engine.open_session()?)
    }

    fn release(&self, session: PooledSession) {
        session.close();
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("idle", &self.idle_count())
            .field("open", &self.open_count())
            .field("epoch", &self.epoch())
            .field("session_max", &self.session_max)
            .finish()
    }
}
