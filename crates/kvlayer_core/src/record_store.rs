//! Record stores: records keyed by [`RecordId`].
//!
//! Each record is one engine entry whose key is the big-endian record id and
//! whose value is the record bytes. Record counts and data sizes are kept in
//! memory, mirrored into the [`SizeStorer`], and seeded either from the size
//! storer or from a scan the first time the store is used.
//!
//! Writes must run inside a unit of work. Count changes follow the unit of
//! work: they are applied immediately and undone by a registered
//! [`Change`](crate::Change) on rollback.

use crate::config::CollectionOptions;
use crate::cursor::CursorHandle;
use crate::error::{CoreError, CoreResult};
use crate::ident::resource_uri;
use crate::operation_context::OperationContext;
use crate::recovery_unit::FnChange;
use crate::size_storer::SizeStorer;
use crate::types::RecordId;
use kvlayer_storage::{EngineConfig, SearchNear};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of [`RecordStore::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidateResults {
    /// Whether the store passed validation.
    pub valid: bool,
    /// Records found by the engine.
    pub records: u64,
    /// Problems found.
    pub errors: Vec<String>,
}

struct Inner {
    ident: String,
    uri: String,
    options: CollectionOptions,
    size_storer: Arc<SizeStorer>,
    loaded: AtomicBool,
    load_lock: Mutex<()>,
    next_id: AtomicU64,
    num_records: AtomicI64,
    data_size: AtomicI64,
}

impl Inner {
    fn adjust(&self, records: i64, bytes: i64) {
        let n = self.num_records.fetch_add(records, Ordering::SeqCst) + records;
        let d = self.data_size.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.size_storer
            .store(&self.uri, clamp_count(n), clamp_count(d));
    }

    fn set(&self, records: i64, bytes: i64) {
        self.num_records.store(records, Ordering::SeqCst);
        self.data_size.store(bytes, Ordering::SeqCst);
        self.size_storer
            .store(&self.uri, clamp_count(records), clamp_count(bytes));
    }
}

fn clamp_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn len_i64(bytes: &[u8]) -> i64 {
    i64::try_from(bytes.len()).unwrap_or(i64::MAX)
}

/// A record store bound to one engine table.
///
/// Cloning is cheap; clones share counters.
#[derive(Clone)]
pub struct RecordStore {
    inner: Arc<Inner>,
}

impl RecordStore {
    pub(crate) fn new(
        ident: &str,
        options: CollectionOptions,
        size_storer: Arc<SizeStorer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ident: ident.to_string(),
                uri: resource_uri(ident),
                options,
                size_storer,
                loaded: AtomicBool::new(false),
                load_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
                num_records: AtomicI64::new(0),
                data_size: AtomicI64::new(0),
            }),
        }
    }

    /// Renders the engine create string for a record store.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` if the extra options make the string malformed.
    pub fn generate_create_string(options: &CollectionOptions, extra: &str) -> CoreResult<String> {
        let mut config = String::from("type=file,memory_page_max=10m,split_pct=90,");
        config.push_str("leaf_value_max=64MB,checksum=on,");
        for part in [extra, options.storage_engine.as_str()] {
            if !part.is_empty() {
                config.push_str(part);
                config.push(',');
            }
        }
        config.push_str("key_format=q,value_format=u,app_metadata=(formatVersion=1)");
        EngineConfig::parse(&config)
            .map_err(|e| CoreError::invalid_options(format!("record store config: {e}")))?;
        Ok(config)
    }

    /// Returns the ident.
    #[must_use]
    pub fn ident(&self) -> &str {
        &self.inner.ident
    }

    /// Returns the engine resource name.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Returns true if the store is capped.
    #[must_use]
    pub fn is_capped(&self) -> bool {
        self.inner.options.capped
    }

    fn cursor(&self, opctx: &mut OperationContext) -> CoreResult<CursorHandle> {
        CursorHandle::new(opctx.recovery_unit(), &self.inner.uri)
    }

    fn ensure_loaded(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        if self.inner.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.inner.load_lock.lock();
        if self.inner.loaded.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut cursor = self.cursor(opctx)?;
        let max_id = if cursor.prev()? {
            cursor.key().and_then(RecordId::from_key)
        } else {
            None
        };
        self.inner
            .next_id
            .store(max_id.map_or(1, |id| id.as_u64() + 1), Ordering::SeqCst);

        match self.inner.size_storer.get(&self.inner.uri) {
            Some(info) => {
                self.inner.num_records.store(
                    i64::try_from(info.num_records).unwrap_or(i64::MAX),
                    Ordering::SeqCst,
                );
                self.inner.data_size.store(
                    i64::try_from(info.data_size).unwrap_or(i64::MAX),
                    Ordering::SeqCst,
                );
            }
            None => {
                cursor.reset();
                let (mut records, mut bytes) = (0i64, 0i64);
                while cursor.next()? {
                    records += 1;
                    bytes += cursor.value().map_or(0, len_i64);
                }
                tracing::debug!(uri = %self.inner.uri, records, bytes, "counted record store");
                self.inner.set(records, bytes);
            }
        }

        self.inner.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn require_unit_of_work(&self, opctx: &mut OperationContext, op: &str) -> CoreResult<()> {
        if opctx.recovery_unit().depth() == 0 {
            return Err(CoreError::invalid_operation(format!(
                "{op} on {} requires a unit of work",
                self.inner.uri
            )));
        }
        Ok(())
    }

    fn track(&self, opctx: &mut OperationContext, records: i64, bytes: i64) {
        self.inner.adjust(records, bytes);
        let inner = Arc::clone(&self.inner);
        opctx.recovery_unit().register_change(Box::new(
            FnChange::new().on_rollback(move || inner.adjust(-records, -bytes)),
        ));
    }

    /// Inserts a record, returning its new id.
    ///
    /// A capped store deletes its oldest records in the same unit of work
    /// until it is back within its limits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` outside a unit of work, `NotFound` if the
    /// table is gone, or `InvalidOptions` if a single record exceeds the cap.
    pub fn insert_record(&self, opctx: &mut OperationContext, data: &[u8]) -> CoreResult<RecordId> {
        self.require_unit_of_work(opctx, "insert")?;
        if self.is_capped() && data.len() as u64 > self.inner.options.effective_capped_size() {
            return Err(CoreError::invalid_options(format!(
                "record of {} bytes exceeds capped size {}",
                data.len(),
                self.inner.options.effective_capped_size()
            )));
        }
        self.ensure_loaded(opctx)?;

        let id = RecordId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.cursor(opctx)?.insert(&id.to_key(), data, false)?;
        opctx.write_happened();
        self.track(opctx, 1, len_i64(data));

        if self.is_capped() {
            self.capped_delete_as_needed(opctx, id)?;
        }
        Ok(id)
    }

    fn over_cap(&self) -> bool {
        let options = &self.inner.options;
        let size = clamp_count(self.inner.data_size.load(Ordering::SeqCst));
        let count = clamp_count(self.inner.num_records.load(Ordering::SeqCst));
        size > options.effective_capped_size()
            || options.effective_capped_max_docs().is_some_and(|max| count > max)
    }

    fn capped_delete_as_needed(
        &self,
        opctx: &mut OperationContext,
        just_inserted: RecordId,
    ) -> CoreResult<()> {
        let mut deleted = 0u64;
        while self.over_cap() {
            let mut cursor = self.cursor(opctx)?;
            if !cursor.next()? {
                break;
            }
            let (Some(id), Some(len)) = (
                cursor.key().and_then(RecordId::from_key),
                cursor.value().map(len_i64),
            ) else {
                break;
            };
            if id >= just_inserted {
                break;
            }
            cursor.remove(&id.to_key())?;
            drop(cursor);
            self.track(opctx, -1, -len);
            deleted += 1;
        }
        if deleted > 0 {
            tracing::trace!(uri = %self.inner.uri, deleted, "capped delete");
        }
        Ok(())
    }

    /// Replaces a record's bytes.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchKey` if the record does not exist.
    pub fn update_record(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
        data: &[u8],
    ) -> CoreResult<()> {
        self.require_unit_of_work(opctx, "update")?;
        self.ensure_loaded(opctx)?;

        let mut cursor = self.cursor(opctx)?;
        let Some(old) = cursor.search(&id.to_key())? else {
            return Err(CoreError::no_such_key(format!("{id} in {}", self.inner.uri)));
        };
        cursor.insert(&id.to_key(), data, true)?;
        drop(cursor);
        opctx.write_happened();
        self.track(opctx, 0, len_i64(data) - len_i64(&old));
        Ok(())
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns `NoSuchKey` if the record does not exist.
    pub fn delete_record(&self, opctx: &mut OperationContext, id: RecordId) -> CoreResult<()> {
        self.require_unit_of_work(opctx, "delete")?;
        self.ensure_loaded(opctx)?;

        let mut cursor = self.cursor(opctx)?;
        let Some(old) = cursor.search(&id.to_key())? else {
            return Err(CoreError::no_such_key(format!("{id} in {}", self.inner.uri)));
        };
        cursor.remove(&id.to_key())?;
        drop(cursor);
        opctx.write_happened();
        self.track(opctx, -1, -len_i64(&old));
        Ok(())
    }

    /// Reads a record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn find_record(
        &self,
        opctx: &mut OperationContext,
        id: RecordId,
    ) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.cursor(opctx)?.search(&id.to_key())?)
    }

    /// Deletes every record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` outside a unit of work.
    pub fn truncate(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        self.require_unit_of_work(opctx, "truncate")?;
        self.ensure_loaded(opctx)?;

        let mut cursor = self.cursor(opctx)?;
        let mut keys = Vec::new();
        let mut bytes = 0i64;
        while cursor.next()? {
            if let Some(key) = cursor.key() {
                keys.push(key.to_vec());
                bytes += cursor.value().map_or(0, len_i64);
            }
        }
        for key in &keys {
            cursor.remove(key)?;
        }
        drop(cursor);

        if !keys.is_empty() {
            opctx.write_happened();
        }
        let records = i64::try_from(keys.len()).unwrap_or(i64::MAX);
        self.track(opctx, -records, -bytes);
        Ok(())
    }

    /// Returns the number of records.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn num_records(&self, opctx: &mut OperationContext) -> CoreResult<u64> {
        self.ensure_loaded(opctx)?;
        Ok(clamp_count(self.inner.num_records.load(Ordering::SeqCst)))
    }

    /// Returns the total size of the records in bytes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn data_size(&self, opctx: &mut OperationContext) -> CoreResult<u64> {
        self.ensure_loaded(opctx)?;
        Ok(clamp_count(self.inner.data_size.load(Ordering::SeqCst)))
    }

    /// Returns the bytes the engine uses for the table.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn storage_size(&self, opctx: &mut OperationContext) -> CoreResult<u64> {
        Ok(opctx
            .recovery_unit()
            .session()
            .session()
            .table_size(&self.inner.uri)?)
    }

    /// Verifies the table and, with `full`, recounts it.
    ///
    /// A recount that disagrees with the tracked counters corrects them.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn validate(
        &self,
        opctx: &mut OperationContext,
        full: bool,
    ) -> CoreResult<ValidateResults> {
        self.ensure_loaded(opctx)?;
        let mut results = ValidateResults {
            valid: true,
            ..ValidateResults::default()
        };

        match opctx.recovery_unit().session().session().verify(&self.inner.uri) {
            Ok(records) => results.records = records,
            Err(err) => {
                results.valid = false;
                results.errors.push(err.to_string());
                return Ok(results);
            }
        }

        if full {
            let mut cursor = self.cursor(opctx)?;
            let mut bytes = 0i64;
            while cursor.next()? {
                bytes += cursor.value().map_or(0, len_i64);
            }
            drop(cursor);

            let records = i64::try_from(results.records).unwrap_or(i64::MAX);
            let tracked = (
                self.inner.num_records.load(Ordering::SeqCst),
                self.inner.data_size.load(Ordering::SeqCst),
            );
            if tracked != (records, bytes) {
                tracing::warn!(
                    uri = %self.inner.uri,
                    tracked_records = tracked.0,
                    records,
                    "record store counters corrected by validate"
                );
                self.inner.set(records, bytes);
            }
        }
        Ok(results)
    }

    /// Pages the table in. The engine keeps tables resident, so this only
    /// checks the table exists.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn touch(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        self.cursor(opctx).map(drop)
    }

    /// Opens a cursor over the records.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn get_cursor(
        &self,
        opctx: &mut OperationContext,
        forward: bool,
    ) -> CoreResult<RecordCursor> {
        Ok(RecordCursor {
            handle: self.cursor(opctx)?,
            forward,
            eof: false,
        })
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("uri", &self.inner.uri)
            .field("capped", &self.inner.options.capped)
            .field("loaded", &self.inner.loaded.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Iterates the records of a store in id order.
pub struct RecordCursor {
    handle: CursorHandle,
    forward: bool,
    eof: bool,
}

impl RecordCursor {
    /// Returns the next record, or `None` at the end.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table was dropped.
    pub fn next(&mut self) -> CoreResult<Option<(RecordId, Vec<u8>)>> {
        if self.eof {
            return Ok(None);
        }
        let moved = if self.forward {
            self.handle.next()?
        } else {
            self.handle.prev()?
        };
        if !moved {
            self.eof = true;
            return Ok(None);
        }
        match (self.handle.key().and_then(RecordId::from_key), self.handle.value()) {
            (Some(id), Some(value)) => Ok(Some((id, value.to_vec()))),
            _ => Err(CoreError::type_mismatch(format!(
                "malformed record key in {}",
                self.handle.uri()
            ))),
        }
    }

    /// Positions so the next call to [`next`](Self::next) returns `id` or
    /// the first record past it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table was dropped.
    pub fn seek(&mut self, id: RecordId) -> CoreResult<()> {
        self.eof = false;
        match self.handle.search_near(&id.to_key())? {
            None => self.eof = true,
            Some(near) => {
                let step_back = match (near, self.forward) {
                    (SearchNear::Exact, _) => true,
                    (SearchNear::Greater, true) | (SearchNear::Less, false) => true,
                    (SearchNear::Greater, false) | (SearchNear::Less, true) => false,
                };
                if step_back {
                    let moved = if self.forward {
                        self.handle.prev()?
                    } else {
                        self.handle.next()?
                    };
                    if !moved {
                        self.handle.reset();
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns true once the cursor ran off the end.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::connection::EngineConnection;
    use crate::operation_context::WriteUnitOfWork;
    use crate::process::ProcessContext;

    fn setup(options: &CollectionOptions) -> (Arc<ProcessContext>, RecordStore) {
        let conn = EngineConnection::open_in_memory(EngineOptions::new().cache_size_gb(1)).unwrap();
        conn.create_record_store("r1", options).unwrap();
        let rs = conn.get_record_store("r1", options);
        (ProcessContext::new(Arc::new(conn)), rs)
    }

    fn insert_all(
        opctx: &mut OperationContext,
        rs: &RecordStore,
        records: &[&[u8]],
    ) -> Vec<RecordId> {
        let mut wuow = WriteUnitOfWork::new(opctx).unwrap();
        let ids = records
            .iter()
            .map(|r| rs.insert_record(&mut wuow, r).unwrap())
            .collect();
        wuow.commit().unwrap();
        ids
    }

    #[test]
    fn crud() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        let ids = insert_all(&mut opctx, &rs, &[b"one", b"two"]);
        assert_eq!(ids, vec![RecordId::new(1), RecordId::new(2)]);
        assert_eq!(rs.find_record(&mut opctx, ids[0]).unwrap(), Some(b"one".to_vec()));

        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        rs.update_record(&mut wuow, ids[0], b"uno!").unwrap();
        rs.delete_record(&mut wuow, ids[1]).unwrap();
        wuow.commit().unwrap();

        assert_eq!(rs.find_record(&mut opctx, ids[0]).unwrap(), Some(b"uno!".to_vec()));
        assert_eq!(rs.find_record(&mut opctx, ids[1]).unwrap(), None);
        assert_eq!(rs.num_records(&mut opctx).unwrap(), 1);
        assert_eq!(rs.data_size(&mut opctx).unwrap(), 4);
    }

    #[test]
    fn writes_require_unit_of_work() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        let err = rs.insert_record(&mut opctx, b"x").unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
    }

    #[test]
    fn rollback_restores_counters() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        insert_all(&mut opctx, &rs, &[b"keep"]);
        {
            let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
            rs.insert_record(&mut wuow, b"discard").unwrap();
            assert_eq!(rs.num_records(&mut wuow).unwrap(), 2);
        }
        assert_eq!(rs.num_records(&mut opctx).unwrap(), 1);
        assert_eq!(rs.data_size(&mut opctx).unwrap(), 4);
        let info = opctx.process().connection().size_storer().load(rs.uri());
        assert_eq!((info.num_records, info.data_size), (1, 4));
    }

    #[test]
    fn missing_records_are_no_such_key() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        let err = rs.delete_record(&mut wuow, RecordId::new(9)).unwrap_err();
        assert!(matches!(err, CoreError::NoSuchKey { .. }));
        let err = rs.update_record(&mut wuow, RecordId::new(9), b"x").unwrap_err();
        assert!(matches!(err, CoreError::NoSuchKey { .. }));
    }

    #[test]
    fn capped_store_deletes_oldest() {
        let (process, rs) = setup(&CollectionOptions::capped(10_000, 3));
        let mut opctx = OperationContext::new(process, 1);
        let ids = insert_all(&mut opctx, &rs, &[b"a", b"b", b"c", b"d", b"e"]);

        assert_eq!(rs.num_records(&mut opctx).unwrap(), 3);
        assert_eq!(rs.find_record(&mut opctx, ids[0]).unwrap(), None);
        assert_eq!(rs.find_record(&mut opctx, ids[1]).unwrap(), None);
        assert_eq!(rs.find_record(&mut opctx, ids[4]).unwrap(), Some(b"e".to_vec()));
    }

    #[test]
    fn capped_store_rejects_oversized_record() {
        let (process, rs) = setup(&CollectionOptions::capped(8, 0));
        let mut opctx = OperationContext::new(process, 1);
        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        assert!(rs.insert_record(&mut wuow, &[0u8; 9]).is_err());
    }

    #[test]
    fn ids_continue_after_reload() {
        let conn = Arc::new(
            EngineConnection::open_in_memory(EngineOptions::new().cache_size_gb(1)).unwrap(),
        );
        conn.create_record_store("r1", &CollectionOptions::default()).unwrap();
        let process = ProcessContext::new(Arc::clone(&conn));
        let mut opctx = OperationContext::new(process, 1);

        let first = conn.get_record_store("r1", &CollectionOptions::default());
        insert_all(&mut opctx, &first, &[b"a", b"b"]);

        conn.size_storer().remove(first.uri());
        let second = conn.get_record_store("r1", &CollectionOptions::default());
        let ids = insert_all(&mut opctx, &second, &[b"c"]);
        assert_eq!(ids, vec![RecordId::new(3)]);
        assert_eq!(second.num_records(&mut opctx).unwrap(), 3);
    }

    #[test]
    fn cursor_both_directions_and_seek() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        insert_all(&mut opctx, &rs, &[b"1", b"2", b"3"]);

        let mut forward = rs.get_cursor(&mut opctx, true).unwrap();
        let mut seen = Vec::new();
        while let Some((id, _)) = forward.next().unwrap() {
            seen.push(id.as_u64());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(forward.is_eof());

        let mut backward = rs.get_cursor(&mut opctx, false).unwrap();
        assert_eq!(backward.next().unwrap().unwrap().0, RecordId::new(3));

        forward.seek(RecordId::new(2)).unwrap();
        assert_eq!(forward.next().unwrap().unwrap().0, RecordId::new(2));
        backward.seek(RecordId::new(2)).unwrap();
        assert_eq!(backward.next().unwrap().unwrap().0, RecordId::new(2));
    }

    #[test]
    fn truncate_and_validate() {
        let (process, rs) = setup(&CollectionOptions::default());
        let mut opctx = OperationContext::new(process, 1);
        insert_all(&mut opctx, &rs, &[b"aa", b"bb"]);

        let results = rs.validate(&mut opctx, true).unwrap();
        assert!(results.valid);
        assert_eq!(results.records, 2);

        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        rs.truncate(&mut wuow).unwrap();
        wuow.commit().unwrap();
        assert_eq!(rs.num_records(&mut opctx).unwrap(), 0);
        assert_eq!(rs.data_size(&mut opctx).unwrap(), 0);
        rs.touch(&mut opctx).unwrap();
    }

    #[test]
    fn create_string_includes_extras() {
        let config = RecordStore::generate_create_string(
            &CollectionOptions::default(),
            "block_compressor=zlib",
        )
        .unwrap();
        assert!(config.contains("block_compressor=zlib,"));
        assert!(config.ends_with("app_metadata=(formatVersion=1)"));
        assert!(RecordStore::generate_create_string(&CollectionOptions::default(), "x=(").is_err());
    }
}
