//! Test fixtures and engine helpers.
//!
//! Provides engines with the process context around them, so tests can go
//! straight to record stores, indexes and operation contexts.

use kvlayer_core::{
    CollectionOptions, EngineConnection, EngineOptions, IndexDescriptor, OperationContext,
    ProcessContext, RecordStore, SortedIndex,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// An engine connection with its process context and automatic cleanup.
pub struct TestEngine {
    /// The process context owning the connection.
    pub process: Arc<ProcessContext>,
    next_connection_id: AtomicU64,
    options: EngineOptions,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// Creates an in-memory engine.
    pub fn memory() -> Self {
        Self::memory_with(EngineOptions::new())
    }

    /// Creates an in-memory engine with custom options.
    pub fn memory_with(options: EngineOptions) -> Self {
        let conn = EngineConnection::open_in_memory(options.clone())
            .expect("Failed to open in-memory engine");
        Self::assemble(conn, options, None)
    }

    /// Creates a durable engine in a fresh temporary directory.
    pub fn file() -> Self {
        Self::file_with(EngineOptions::new())
    }

    /// Creates a durable engine in a fresh temporary directory with custom
    /// options.
    pub fn file_with(options: EngineOptions) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let conn = EngineConnection::open(temp_dir.path(), options.clone())
            .expect("Failed to open file engine");
        Self::assemble(conn, options, Some(temp_dir))
    }

    fn assemble(conn: EngineConnection, options: EngineOptions, temp_dir: Option<TempDir>) -> Self {
        Self {
            process: ProcessContext::new(Arc::new(conn)),
            next_connection_id: AtomicU64::new(1),
            options,
            _temp_dir: temp_dir,
        }
    }

    /// Shuts the engine down and opens it again on the same directory.
    ///
    /// Every operation context must be dropped first, or the directory lock
    /// is still held.
    ///
    /// # Panics
    ///
    /// Panics for an in-memory engine.
    pub fn reopen(self) -> Self {
        let Self {
            process,
            options,
            _temp_dir,
            ..
        } = self;
        let temp_dir = _temp_dir.expect("Cannot reopen an in-memory engine");
        process
            .connection()
            .shutdown()
            .expect("Failed to shut down engine");
        drop(process);

        let conn = EngineConnection::open(temp_dir.path(), options.clone())
            .expect("Failed to reopen file engine");
        Self::assemble(conn, options, Some(temp_dir))
    }

    /// Returns the connection.
    pub fn conn(&self) -> &Arc<EngineConnection> {
        self.process.connection()
    }

    /// Returns the engine directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().to_path_buf())
    }

    /// Creates an operation context on a new client connection id.
    pub fn opctx(&self) -> OperationContext {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        OperationContext::new(Arc::clone(&self.process), id)
    }

    /// Creates a record store and returns it, creating its table if absent.
    pub fn record_store(&self, ident: &str) -> RecordStore {
        self.record_store_with(ident, &CollectionOptions::default())
    }

    /// Creates a record store with custom options.
    pub fn record_store_with(&self, ident: &str, options: &CollectionOptions) -> RecordStore {
        if !self.conn().has_ident(ident).expect("Failed to check ident") {
            self.conn()
                .create_record_store(ident, options)
                .expect("Failed to create record store");
        }
        self.conn().get_record_store(ident, options)
    }

    /// Creates a single-field index on `a` and returns it.
    pub fn index(&self, ident: &str, unique: bool) -> SortedIndex {
        let mut descriptor = IndexDescriptor::new(format!("{ident}_a"), &["a"]);
        if unique {
            descriptor = descriptor.unique();
        }
        self.index_with(ident, &descriptor)
    }

    /// Creates an index from a descriptor, creating its table if absent.
    pub fn index_with(&self, ident: &str, descriptor: &IndexDescriptor) -> SortedIndex {
        if !self.conn().has_ident(ident).expect("Failed to check ident") {
            self.conn()
                .create_sorted_data_interface(ident, descriptor)
                .expect("Failed to create index");
        }
        self.conn().get_sorted_data_interface(ident, descriptor)
    }
}

impl std::fmt::Debug for TestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEngine")
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

/// Runs a test with an in-memory engine.
///
/// # Example
///
/// ```rust
/// use kvlayer_testkit::with_memory_engine;
///
/// with_memory_engine(|engine| {
///     assert!(engine.path().is_none());
/// });
/// ```
pub fn with_memory_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::memory();
    f(&engine)
}

/// Runs a test with a durable engine in a temporary directory.
pub fn with_file_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let engine = TestEngine::file();
    f(&engine)
}

/// Returns true if `dir` holds an engine checkpoint image.
pub fn has_checkpoint(dir: &Path) -> bool {
    dir.join(kvlayer_storage::CHECKPOINT_FILE).exists()
}
