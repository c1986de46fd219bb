//! Sorted indexes mapping keys to record ids.
//!
//! ## Layout
//!
//! Every logical entry is the pair `(key, rid)`, ordered by the encoded key
//! and then by rid. How entries map onto engine rows depends on the
//! [`IndexKind`]:
//!
//! - **Standard**: one row per entry. Row key is `encode(key) ‖ rid`, value
//!   is empty.
//! - **Unique**: one row per distinct key. Row key is `encode(key)`, value is
//!   the concatenated big-endian rids of the key in ascending order. More
//!   than one rid only appears when duplicates were explicitly allowed.

mod bulk;
mod cursor;
mod key;

pub use bulk::BulkBuilder;
pub use cursor::IndexCursor;
pub use key::{encode_fields, IndexKey, KeyField, MAX_KEY_BYTES};

use crate::config::IndexDescriptor;
use crate::cursor::CursorHandle;
use crate::error::{fatal, CoreError, CoreResult};
use crate::ident::resource_uri;
use crate::operation_context::OperationContext;
use crate::types::RecordId;
use kvlayer_storage::EngineConfig;
use std::sync::Arc;

/// Duplicate handling strategy of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Any number of records per key.
    Standard,
    /// One record per key unless duplicates are explicitly allowed.
    Unique,
}

impl IndexKind {
    /// Returns the engine row key for an entry.
    fn row_key(self, encoded: &[u8], rid: RecordId) -> Vec<u8> {
        let mut row = encoded.to_vec();
        if self == Self::Standard {
            row.extend_from_slice(&rid.to_key());
        }
        row
    }

    /// Returns the record ids stored in one engine row.
    fn row_rids(self, row_key: &[u8], value: &[u8]) -> CoreResult<Vec<RecordId>> {
        let malformed = || CoreError::type_mismatch("malformed index row");
        match self {
            Self::Standard => {
                let split = row_key
                    .len()
                    .checked_sub(RecordId::ENCODED_LEN)
                    .ok_or_else(malformed)?;
                let rid = RecordId::from_key(&row_key[split..]).ok_or_else(malformed)?;
                Ok(vec![rid])
            }
            Self::Unique => {
                if value.is_empty() || value.len() % RecordId::ENCODED_LEN != 0 {
                    return Err(malformed());
                }
                value
                    .chunks(RecordId::ENCODED_LEN)
                    .map(|chunk| RecordId::from_key(chunk).ok_or_else(malformed))
                    .collect()
            }
        }
    }

    /// Returns the encoded key part of a row key.
    fn row_encoded_key(self, row_key: &[u8]) -> &[u8] {
        match self {
            Self::Standard => &row_key[..row_key.len().saturating_sub(RecordId::ENCODED_LEN)],
            Self::Unique => row_key,
        }
    }
}

fn encode_rids(rids: &[RecordId]) -> Vec<u8> {
    rids.iter().flat_map(|r| r.to_key()).collect()
}

struct Inner {
    ident: String,
    uri: String,
    descriptor: IndexDescriptor,
    kind: IndexKind,
    instance_id: u64,
}

/// A sorted index bound to one engine table.
///
/// Cloning is cheap.
#[derive(Clone)]
pub struct SortedIndex {
    inner: Arc<Inner>,
}

impl SortedIndex {
    pub(crate) fn new(ident: &str, descriptor: IndexDescriptor, instance_id: u64) -> Self {
        let kind = if descriptor.unique {
            IndexKind::Unique
        } else {
            IndexKind::Standard
        };
        Self {
            inner: Arc::new(Inner {
                ident: ident.to_string(),
                uri: resource_uri(ident),
                descriptor,
                kind,
                instance_id,
            }),
        }
    }

    /// Renders the engine create string for an index.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` for an invalid descriptor or malformed extra
    /// options.
    pub fn generate_create_string(descriptor: &IndexDescriptor, extra: &str) -> CoreResult<String> {
        descriptor.validate()?;
        let mut config = String::from("type=file,internal_page_max=16k,leaf_page_max=16k,");
        config.push_str("checksum=on,prefix_compression=true,");
        if !extra.is_empty() {
            config.push_str(extra);
            config.push(',');
        }
        config.push_str("key_format=u,value_format=u,");
        config.push_str(&format!(
            "app_metadata=(formatVersion=6,name={},unique={},fields=[{}])",
            descriptor.name,
            descriptor.unique,
            descriptor.key_pattern.join(",")
        ));
        EngineConfig::parse(&config)
            .map_err(|e| CoreError::invalid_options(format!("index config: {e}")))?;
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

    /// Returns the descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.inner.descriptor
    }

    /// Returns the duplicate handling strategy.
    #[must_use]
    pub fn kind(&self) -> IndexKind {
        self.inner.kind
    }

    /// Returns the id distinguishing this handle from other handles on the
    /// same ident.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    pub(crate) fn field_count(&self) -> usize {
        self.inner.descriptor.field_count()
    }

    pub(crate) fn open_handle(&self, opctx: &mut OperationContext) -> CoreResult<CursorHandle> {
        CursorHandle::new(opctx.recovery_unit(), &self.inner.uri)
    }

    fn render(&self, key: &IndexKey) -> String {
        key.render(&self.inner.descriptor.key_pattern)
    }

    fn encode_checked(&self, key: &IndexKey) -> CoreResult<Vec<u8>> {
        if key.len() != self.field_count() {
            return Err(CoreError::invalid_operation(format!(
                "key {} has {} fields, index {} has {}",
                key,
                key.len(),
                self.inner.descriptor.name,
                self.field_count()
            )));
        }
        let encoded = key.encode();
        if encoded.len() > MAX_KEY_BYTES {
            return Err(CoreError::KeyTooLong {
                uri: self.inner.uri.clone(),
                len: encoded.len(),
                max: MAX_KEY_BYTES,
            });
        }
        Ok(encoded)
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

    /// Adds an entry.
    ///
    /// Inserting an entry that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` if a unique index holds the key for another
    /// record and `dups_allowed` is false, `KeyTooLong` for oversized keys,
    /// or `InvalidOperation` outside a unit of work.
    pub fn insert(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
        dups_allowed: bool,
    ) -> CoreResult<()> {
        self.require_unit_of_work(opctx, "insert")?;
        let encoded = self.encode_checked(key)?;
        let mut cursor = self.open_handle(opctx)?;

        match self.inner.kind {
            IndexKind::Standard => {
                cursor.insert(&IndexKind::Standard.row_key(&encoded, rid), &[], true)?;
            }
            IndexKind::Unique => {
                let mut rids = match cursor.search(&encoded)? {
                    Some(value) => IndexKind::Unique.row_rids(&encoded, &value)?,
                    None => Vec::new(),
                };
                if let Err(pos) = rids.binary_search(&rid) {
                    if !rids.is_empty() && !dups_allowed {
                        return Err(CoreError::duplicate_key(&self.inner.uri, self.render(key)));
                    }
                    rids.insert(pos, rid);
                    cursor.insert(&encoded, &encode_rids(&rids), true)?;
                }
            }
        }
        drop(cursor);
        opctx.write_happened();
        Ok(())
    }

    /// Removes an entry.
    ///
    /// A missing entry is tolerated when `dups_allowed`; otherwise it is an
    /// invariant violation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` outside a unit of work.
    pub fn unindex(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
        dups_allowed: bool,
    ) -> CoreResult<()> {
        self.require_unit_of_work(opctx, "unindex")?;
        let encoded = self.encode_checked(key)?;
        let mut cursor = self.open_handle(opctx)?;

        let removed = match self.inner.kind {
            IndexKind::Standard => {
                let row = IndexKind::Standard.row_key(&encoded, rid);
                if cursor.search(&row)?.is_some() {
                    cursor.remove(&row)?;
                    true
                } else {
                    false
                }
            }
            IndexKind::Unique => match cursor.search(&encoded)? {
                None => false,
                Some(value) => {
                    let mut rids = IndexKind::Unique.row_rids(&encoded, &value)?;
                    match rids.binary_search(&rid) {
                        Err(_) => false,
                        Ok(pos) => {
                            rids.remove(pos);
                            if rids.is_empty() {
                                cursor.remove(&encoded)?;
                            } else {
                                cursor.insert(&encoded, &encode_rids(&rids), true)?;
                            }
                            true
                        }
                    }
                }
            },
        };
        drop(cursor);

        if !removed {
            if !dups_allowed {
                fatal(format_args!(
                    "unindex of missing entry {} {rid} in {}",
                    self.render(key),
                    self.inner.uri
                ));
            }
            tracing::debug!(uri = %self.inner.uri, %rid, "unindex of missing entry ignored");
            return Ok(());
        }
        opctx.write_happened();
        Ok(())
    }

    /// Returns true if a record other than `rid` holds `key`.
    ///
    /// Standard indexes never report duplicates.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn is_dup(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
    ) -> CoreResult<bool> {
        if self.inner.kind == IndexKind::Standard {
            return Ok(false);
        }
        let encoded = self.encode_checked(key)?;
        let mut cursor = self.open_handle(opctx)?;
        let Some(value) = cursor.search(&encoded)? else {
            return Ok(false);
        };
        let rids = IndexKind::Unique.row_rids(&encoded, &value)?;
        Ok(rids.iter().any(|r| *r != rid))
    }

    /// Fails if a record other than `rid` holds `key`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateKey` when [`is_dup`](Self::is_dup) is true.
    pub fn dup_key_check(
        &self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
    ) -> CoreResult<()> {
        if self.is_dup(opctx, key, rid)? {
            return Err(CoreError::duplicate_key(&self.inner.uri, self.render(key)));
        }
        Ok(())
    }

    /// Verifies the table and every entry, returning the number of entries.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` for an undecodable entry or an engine error if
    /// verification fails.
    pub fn full_validate(&self, opctx: &mut OperationContext) -> CoreResult<u64> {
        opctx
            .recovery_unit()
            .session()
            .session()
            .verify(&self.inner.uri)?;

        let mut cursor = self.open_handle(opctx)?;
        let mut entries = 0u64;
        while cursor.next()? {
            let (Some(row), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            let encoded = self.inner.kind.row_encoded_key(row);
            let (_, used) = IndexKey::decode_prefix(encoded, self.field_count())?;
            if used != encoded.len() {
                return Err(CoreError::type_mismatch(format!(
                    "trailing bytes in index entry of {}",
                    self.inner.uri
                )));
            }
            entries += self.inner.kind.row_rids(row, value)?.len() as u64;
        }
        Ok(entries)
    }

    /// Returns true if the index has no entries.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn is_empty(&self, opctx: &mut OperationContext) -> CoreResult<bool> {
        Ok(!self.open_handle(opctx)?.next()?)
    }

    /// Pages the index in. The engine keeps tables resident, so this only
    /// checks the table exists.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn touch(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        self.open_handle(opctx).map(drop)
    }

    /// Returns the bytes the engine uses for the index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn get_space_used_bytes(&self, opctx: &mut OperationContext) -> CoreResult<u64> {
        Ok(opctx
            .recovery_unit()
            .session()
            .session()
            .table_size(&self.inner.uri)?)
    }

    /// Prepares a freshly created index for use. Nothing to do for this
    /// layout beyond checking the table exists.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn init_as_empty(&self, opctx: &mut OperationContext) -> CoreResult<()> {
        self.touch(opctx)
    }

    /// Opens a cursor over the index.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn new_cursor(
        &self,
        opctx: &mut OperationContext,
        forward: bool,
    ) -> CoreResult<IndexCursor> {
        IndexCursor::new(self.clone(), opctx, forward)
    }

    /// Returns a builder for loading pre-sorted entries.
    #[must_use]
    pub fn get_bulk_builder(&self, dups_allowed: bool) -> BulkBuilder {
        BulkBuilder::new(self.clone(), dups_allowed)
    }
}

impl std::fmt::Debug for SortedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedIndex")
            .field("uri", &self.inner.uri)
            .field("name", &self.inner.descriptor.name)
            .field("kind", &self.inner.kind)
            .field("instance_id", &self.inner.instance_id)
            .finish()
    }
}
