//! Engine capability traits.

use crate::error::EngineResult;

/// Outcome of [`KvCursor::search_near`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchNear {
    /// The cursor rests on the requested key.
    Exact,
    /// The cursor rests on the smallest key greater than the requested key.
    Greater,
    /// The cursor rests on the largest key smaller than the requested key.
    Less,
}

/// An embedded key-value engine.
///
/// The engine is the process-wide owner of all tables. All work happens
/// through sessions, which are comparatively expensive to open and are
/// expected to be pooled by the caller.
///
/// # Invariants
///
/// - A table cannot be dropped while any cursor (open or cached by a session)
///   references it; such drops fail with `Busy`
/// - Closing the engine invalidates every session
pub trait KvEngine: Send + Sync {
    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the engine has been closed.
    fn open_session(&self) -> EngineResult<Box<dyn KvSession>>;

    /// Checkpoints and closes the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the final checkpoint cannot be written.
    fn close(&self) -> EngineResult<()>;

    /// Returns the number of sessions currently open.
    fn open_session_count(&self) -> usize;
}

/// A single-threaded handle onto the engine.
///
/// A session owns at most one transaction at a time. Cursors opened from a
/// session read and write through that transaction; with no transaction
/// running every write commits on its own.
pub trait KvSession: Send {
    /// Returns the engine-unique session identifier.
    fn id(&self) -> u64;

    /// Creates a table.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the table exists or `InvalidConfig` if the
    /// configuration string is malformed.
    fn create(&mut self, uri: &str, config: &str) -> EngineResult<()>;

    /// Drops a table. With `"force"` in `config` a missing table is not an error.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if cursors still reference the table.
    fn drop_table(&mut self, uri: &str, config: &str) -> EngineResult<()>;

    /// Returns true if the table exists.
    fn table_exists(&self, uri: &str) -> EngineResult<bool>;

    /// Opens a cursor on a table.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table does not exist.
    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn KvCursor>>;

    /// Starts a transaction. `"sync=true"` forces the commit to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a transaction is already running.
    fn begin_transaction(&mut self, config: &str) -> EngineResult<()>;

    /// Commits the running transaction.
    ///
    /// # Errors
    ///
    /// Returns `WriteConflict` if another transaction committed a write to the
    /// same key after this transaction's snapshot; the transaction is rolled
    /// back in that case.
    fn commit_transaction(&mut self) -> EngineResult<()>;

    /// Rolls back the running transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if no transaction is running.
    fn rollback_transaction(&mut self) -> EngineResult<()>;

    /// Returns true while a transaction is running.
    fn in_transaction(&self) -> bool;

    /// Writes a checkpoint of all committed data.
    fn checkpoint(&mut self) -> EngineResult<()>;

    /// Forces every journaled commit to durable storage.
    ///
    /// A no-op when the engine runs without a journal.
    fn log_flush(&mut self) -> EngineResult<()>;

    /// Compacts a table.
    fn compact(&mut self, uri: &str) -> EngineResult<()>;

    /// Verifies a table's structure, returning the number of entries.
    fn verify(&mut self, uri: &str) -> EngineResult<u64>;

    /// Returns the approximate number of bytes used by a table.
    fn table_size(&self, uri: &str) -> EngineResult<u64>;

    /// Lists the tables whose names start with `prefix`.
    fn list_tables(&self, prefix: &str) -> EngineResult<Vec<String>>;
}

/// A positioned cursor over one table.
///
/// A freshly opened or [`reset`](KvCursor::reset) cursor is unpositioned:
/// `next` moves to the first entry and `prev` to the last.
pub trait KvCursor: Send {
    /// Returns the table this cursor reads.
    fn uri(&self) -> &str;

    /// Releases the cursor's position.
    fn reset(&mut self);

    /// Positions on `key` if present and returns its value.
    fn search(&mut self, key: &[u8]) -> EngineResult<Option<Vec<u8>>>;

    /// Positions on `key` or the nearest existing neighbour.
    ///
    /// Returns `None` if the table has no visible entries.
    fn search_near(&mut self, key: &[u8]) -> EngineResult<Option<SearchNear>>;

    /// Moves forward. Returns false (and unpositions) at the end.
    fn next(&mut self) -> EngineResult<bool>;

    /// Moves backward. Returns false (and unpositions) at the start.
    fn prev(&mut self) -> EngineResult<bool>;

    /// Returns the key under the cursor.
    fn key(&self) -> Option<&[u8]>;

    /// Returns the value under the cursor.
    fn value(&self) -> Option<&[u8]>;

    /// Inserts a key. Without `overwrite` an existing key is a `DuplicateKey`.
    fn insert(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> EngineResult<()>;

    /// Removes a key.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is not visible to this cursor.
    fn remove(&mut self, key: &[u8]) -> EngineResult<()>;
}
