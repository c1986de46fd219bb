//! Process-wide handle to the key-value engine.
//!
//! The connection owns the engine, the session pool and the size storer, and
//! brokers the lifecycle of every record store and index resource.
//!
//! ## Deferred Drops
//!
//! The engine refuses to drop a table that any cursor references. When that
//! happens the resource name is queued, the pool epoch advances and idle
//! sessions are closed so their cached cursors let go. Sessions still checked
//! out release theirs when they come back to the pool.
//! [`retry_queued_drops`](EngineConnection::retry_queued_drops) finishes the
//! job from the maintenance path.

use crate::config::{CollectionOptions, EngineOptions, IndexDescriptor};
use crate::dir::EngineDir;
use crate::error::{fatal, CoreResult};
use crate::ident::{resource_uri, SIZE_STORER_URI};
use crate::index::SortedIndex;
use crate::operation_context::OperationContext;
use crate::record_store::RecordStore;
use crate::recovery_unit::RecoveryUnit;
use crate::session_pool::SessionPool;
use crate::size_storer::{ElapsedTracker, SizeStorer};
use kvlayer_storage::{EngineError, InMemoryEngine, KvEngine, KvSession};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The engine connection.
///
/// Exactly one connection exists per running process; it is shared through
/// [`ProcessContext`](crate::ProcessContext).
pub struct EngineConnection {
    engine: Arc<dyn KvEngine>,
    options: EngineOptions,
    dir: Option<EngineDir>,
    pool: Arc<SessionPool>,
    size_storer: Arc<SizeStorer>,
    size_sync: Mutex<()>,
    size_sync_tracker: ElapsedTracker,
    pending_drops: Mutex<BTreeSet<String>>,
    record_store_extra: RwLock<String>,
    index_extra: RwLock<String>,
    next_instance_id: AtomicU64,
    shut_down: AtomicBool,
}

impl EngineConnection {
    /// Opens (or creates) an engine in `path`.
    ///
    /// A configuration the engine rejects and a journal directory that
    /// cannot be created are fatal.
    ///
    /// # Errors
    ///
    /// Returns `EngineLocked` if another process holds `path`, or an error
    /// if the size storer cannot be loaded.
    pub fn open(path: impl AsRef<Path>, options: EngineOptions) -> CoreResult<Self> {
        let dir = EngineDir::open(path.as_ref())?;
        if options.durable {
            if let Err(err) = dir.ensure_journal_dir() {
                fatal(format_args!(
                    "cannot create journal directory {}: {err}",
                    dir.journal_dir().display()
                ));
            }
        }

        let cache_gb = options.effective_cache_size_gb();
        let config = options.open_config_string(cache_gb);
        tracing::info!(path = %dir.path().display(), %config, "opening engine");
        let engine = match InMemoryEngine::open(Some(dir.path()), &config) {
            Ok(engine) => engine,
            Err(err) => fatal(format_args!("engine open failed: {err}")),
        };
        Self::assemble(Arc::new(engine), options, Some(dir))
    }

    /// Opens a purely in-memory engine. Durability is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the size storer cannot be loaded.
    pub fn open_in_memory(options: EngineOptions) -> CoreResult<Self> {
        let options = options.durable(false);
        let config = options.open_config_string(options.effective_cache_size_gb());
        tracing::info!(%config, "opening in-memory engine");
        let engine = match InMemoryEngine::open(None, &config) {
            Ok(engine) => engine,
            Err(err) => fatal(format_args!("engine open failed: {err}")),
        };
        Self::assemble(Arc::new(engine), options, None)
    }

    /// Binds a connection to an already opened engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the size storer cannot be loaded.
    pub fn with_engine(engine: Arc<dyn KvEngine>, options: EngineOptions) -> CoreResult<Self> {
        Self::assemble(engine, options, None)
    }

    fn assemble(
        engine: Arc<dyn KvEngine>,
        options: EngineOptions,
        dir: Option<EngineDir>,
    ) -> CoreResult<Self> {
        let pool = Arc::new(SessionPool::new(Arc::clone(&engine), options.session_max));
        let size_storer = Arc::new(SizeStorer::new());
        {
            let mut session = pool.standalone_session()?;
            size_storer.load_from(session.as_mut(), SIZE_STORER_URI)?;
        }

        Ok(Self {
            size_sync_tracker: ElapsedTracker::new(
                options.size_storer_sync_ops,
                options.size_storer_sync_interval,
            ),
            record_store_extra: RwLock::new(options.record_store_extra_options.clone()),
            index_extra: RwLock::new(options.index_extra_options.clone()),
            engine,
            options,
            dir,
            pool,
            size_storer,
            size_sync: Mutex::new(()),
            pending_drops: Mutex::new(BTreeSet::new()),
            next_instance_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Resource lifecycle
    // =========================================================================

    /// Creates the table behind a record store.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the ident is taken or `InvalidOptions` if
    /// the creation options are malformed.
    pub fn create_record_store(&self, ident: &str, options: &CollectionOptions) -> CoreResult<()> {
        let uri = resource_uri(ident);
        let config = RecordStore::generate_create_string(options, &self.record_store_extra.read())?;
        tracing::debug!(%uri, %config, "creating record store");
        self.pool.standalone_session()?.create(&uri, &config)?;
        Ok(())
    }

    /// Returns a record store bound to `ident`. Existence is checked on first use.
    #[must_use]
    pub fn get_record_store(&self, ident: &str, options: &CollectionOptions) -> RecordStore {
        RecordStore::new(ident, options.clone(), Arc::clone(&self.size_storer))
    }

    /// Drops a record store, deferring the drop if the table is busy.
    ///
    /// # Errors
    ///
    /// Returns an error only if no session could be opened.
    pub fn drop_record_store(&self, ident: &str) -> CoreResult<()> {
        self.drop_ident(ident)
    }

    /// Creates the table behind a sorted index.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the ident is taken or `InvalidOptions` if
    /// the descriptor is malformed.
    pub fn create_sorted_data_interface(
        &self,
        ident: &str,
        descriptor: &IndexDescriptor,
    ) -> CoreResult<()> {
        let uri = resource_uri(ident);
        let config = SortedIndex::generate_create_string(descriptor, &self.index_extra.read())?;
        tracing::debug!(%uri, %config, "creating index");
        self.pool.standalone_session()?.create(&uri, &config)?;
        Ok(())
    }

    /// Returns an index bound to `ident`. Existence is checked on first use.
    #[must_use]
    pub fn get_sorted_data_interface(
        &self,
        ident: &str,
        descriptor: &IndexDescriptor,
    ) -> SortedIndex {
        let instance_id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
        SortedIndex::new(ident, descriptor.clone(), instance_id)
    }

    /// Drops an index, deferring the drop if the table is busy.
    ///
    /// # Errors
    ///
    /// Returns an error only if no session could be opened.
    pub fn drop_sorted_data_interface(&self, ident: &str) -> CoreResult<()> {
        self.drop_ident(ident)
    }

    /// Drops the table behind `ident`.
    ///
    /// A busy table is queued for [`retry_queued_drops`](Self::retry_queued_drops)
    /// and reported as dropped. Any other engine failure is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error only if no session could be opened.
    pub fn drop_ident(&self, ident: &str) -> CoreResult<()> {
        let uri = resource_uri(ident);
        let mut session = self.pool.standalone_session()?;
        match session.drop_table(&uri, "force") {
            Ok(()) => {
                tracing::debug!(%uri, "dropped");
                self.size_storer.remove(&uri);
            }
            Err(EngineError::Busy { .. }) => {
                drop(session);
                let epoch = {
                    let mut pending = self.pending_drops.lock();
                    pending.insert(uri.clone());
                    self.pool.bump_epoch()
                };
                tracing::warn!(%uri, epoch, "drop deferred, resource is busy");
                self.pool.close_all();
            }
            Err(err) => fatal(format_args!("drop of {uri} failed: {err}")),
        }
        Ok(())
    }

    /// Returns true if deferred drops are waiting.
    ///
    /// Also syncs the size storer when its interval has elapsed.
    pub fn have_drops_queued(&self) -> bool {
        if self.size_sync_tracker.interval_has_elapsed() {
            if let Err(err) = self.sync_size_info(false) {
                tracing::warn!(error = %err, "periodic size storer sync failed");
            }
        }
        !self.pending_drops.lock().is_empty()
    }

    /// Retries every deferred drop. Returns the number completed.
    ///
    /// Tables that are still busy stay queued; any other failure is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error only if no session could be opened.
    pub fn retry_queued_drops(&self) -> CoreResult<usize> {
        let queued: Vec<String> = self.pending_drops.lock().iter().cloned().collect();
        if queued.is_empty() {
            return Ok(0);
        }

        let mut session = self.pool.standalone_session()?;
        let mut dropped = 0;
        for uri in queued {
            match session.drop_table(&uri, "force") {
                Ok(()) => {
                    self.pending_drops.lock().remove(&uri);
                    self.size_storer.remove(&uri);
                    tracing::debug!(%uri, "queued drop succeeded");
                    dropped += 1;
                }
                Err(EngineError::Busy { .. }) => {
                    tracing::debug!(%uri, "queued drop still busy");
                }
                Err(err) => fatal(format_args!("queued drop of {uri} failed: {err}")),
            }
        }
        Ok(dropped)
    }

    /// Returns the resource names waiting to be dropped.
    #[must_use]
    pub fn pending_drops(&self) -> Vec<String> {
        self.pending_drops.lock().iter().cloned().collect()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Persists the size storer and checkpoints the engine.
    ///
    /// Returns the number of checkpoints taken: 0 for an engine without a
    /// home directory, otherwise 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    pub fn flush_all_files(&self, sync: bool) -> CoreResult<usize> {
        self.sync_size_info(sync)?;
        if self.dir.is_none() {
            return Ok(0);
        }
        self.pool.standalone_session()?.checkpoint()?;
        tracing::debug!("checkpoint complete");
        Ok(1)
    }

    /// Writes the size storer in its own transaction.
    ///
    /// Losing a write conflict to a concurrent sync, or finding one already
    /// running, is not an error. Other engine failures at commit are fatal.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction could not be started or written.
    pub fn sync_size_info(&self, sync: bool) -> CoreResult<()> {
        let Some(_guard) = self.size_sync.try_lock() else {
            tracing::debug!("size storer sync already running");
            return Ok(());
        };
        self.write_size_info(sync)
    }

    fn write_size_info(&self, sync: bool) -> CoreResult<()> {
        let mut session = self.pool.standalone_session()?;
        session.begin_transaction(if sync { "sync=true" } else { "" })?;

        let written = match self.size_storer.store_into(session.as_mut(), SIZE_STORER_URI) {
            Ok(written) => written,
            Err(err) => {
                if let Err(rollback) = session.rollback_transaction() {
                    tracing::warn!(error = %rollback, "size storer rollback failed");
                }
                return Err(err);
            }
        };

        match session.commit_transaction() {
            Ok(()) => {
                tracing::debug!(entries = written, sync, "size storer synced");
                Ok(())
            }
            Err(EngineError::WriteConflict { .. }) => {
                tracing::warn!("size storer sync lost a write conflict, skipped");
                Ok(())
            }
            Err(err) => fatal(format_args!("size storer commit failed: {err}")),
        }
    }

    // =========================================================================
    // Ident maintenance
    // =========================================================================

    /// Returns the bytes used by the table behind `ident`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the ident does not exist.
    pub fn get_ident_size(&self, opctx: &mut OperationContext, ident: &str) -> CoreResult<u64> {
        let uri = resource_uri(ident);
        Ok(opctx.recovery_unit().session().session().table_size(&uri)?)
    }

    /// Compacts the table behind `ident`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the ident does not exist.
    pub fn repair_ident(&self, ident: &str) -> CoreResult<()> {
        let uri = resource_uri(ident);
        tracing::info!(%uri, "repairing");
        self.pool.standalone_session()?.compact(&uri)?;
        Ok(())
    }

    /// Records the current counts of a record store about to be renamed.
    ///
    /// # Errors
    ///
    /// Returns an error if the counts cannot be read or persisted.
    pub fn ok_to_rename(
        &self,
        opctx: &mut OperationContext,
        from_ns: &str,
        to_ns: &str,
        ident: &str,
        record_store: &RecordStore,
    ) -> CoreResult<()> {
        let num_records = record_store.num_records(opctx)?;
        let data_size = record_store.data_size(opctx)?;
        self.size_storer
            .store(&resource_uri(ident), num_records, data_size);
        tracing::debug!(from_ns, to_ns, ident, num_records, data_size, "rename prepared");
        self.sync_size_info(false)
    }

    // =========================================================================
    // Options and accessors
    // =========================================================================

    /// Returns true: the engine isolates concurrent writers per document.
    #[must_use]
    pub fn supports_doc_locking(&self) -> bool {
        true
    }

    /// Creates a recovery unit drawing on this connection's session pool.
    #[must_use]
    pub fn new_recovery_unit(&self) -> RecoveryUnit {
        RecoveryUnit::new(Arc::clone(&self.pool), self.options.durable)
    }

    /// Replaces the options appended to record store create strings.
    pub fn set_record_store_extra_options(&self, options: impl Into<String>) {
        *self.record_store_extra.write() = options.into();
    }

    /// Replaces the options appended to index create strings.
    pub fn set_sorted_data_interface_extra_options(&self, options: impl Into<String>) {
        *self.index_extra.write() = options.into();
    }

    /// Returns the deferred-drop epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.pool.epoch()
    }

    /// Returns the size storer.
    #[must_use]
    pub fn size_storer(&self) -> &Arc<SizeStorer> {
        &self.size_storer
    }

    /// Returns the session pool.
    #[must_use]
    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Returns the options the connection was opened with.
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Returns the engine home directory, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(EngineDir::path)
    }

    /// Returns true if the table behind `ident` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed.
    pub fn has_ident(&self, ident: &str) -> CoreResult<bool> {
        Ok(self
            .pool
            .standalone_session()?
            .table_exists(&resource_uri(ident))?)
    }

    /// Syncs the size storer, closes idle sessions and closes the engine.
    ///
    /// Runs once; later calls are no-ops. Also runs on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails its final checkpoint.
    pub fn shutdown(&self) -> CoreResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(
            pending_drops = self.pending_drops.lock().len(),
            "shutting down engine connection"
        );

        {
            let _guard = self.size_sync.lock();
            if let Err(err) = self.write_size_info(true) {
                tracing::warn!(error = %err, "final size storer sync failed");
            }
        }
        self.pool.close_all();
        self.engine.close()?;
        Ok(())
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Drop for EngineConnection {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::error!(error = %err, "engine shutdown failed");
        }
    }
}

impl std::fmt::Debug for EngineConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConnection")
            .field("path", &self.path())
            .field("durable", &self.options.durable)
            .field("pool", &self.pool)
            .field("pending_drops", &self.pending_drops.lock().len())
            .finish_non_exhaustive()
    }
}
