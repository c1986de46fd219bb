//! Loading pre-sorted entries into an empty index.

use super::key::IndexKey;
use super::SortedIndex;
use crate::error::{CoreError, CoreResult};
use crate::operation_context::OperationContext;
use crate::types::RecordId;

/// Appends entries in ascending `(key, rid)` order.
///
/// Entries are written through the owning unit of work; nothing is visible
/// to other operations before that unit commits.
#[derive(Debug)]
pub struct BulkBuilder {
    index: SortedIndex,
    dups_allowed: bool,
    last: Option<(Vec<u8>, RecordId)>,
    added: u64,
}

impl BulkBuilder {
    pub(super) fn new(index: SortedIndex, dups_allowed: bool) -> Self {
        Self {
            index,
            dups_allowed,
            last: None,
            added: 0,
        }
    }

    /// Adds the next entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the entry does not sort after the
    /// previous one, or any error [`SortedIndex::insert`] returns.
    pub fn add_key(
        &mut self,
        opctx: &mut OperationContext,
        key: &IndexKey,
        rid: RecordId,
    ) -> CoreResult<()> {
        let encoded = key.encode();
        if let Some((last_key, last_rid)) = &self.last {
            if (encoded.as_slice(), rid) <= (last_key.as_slice(), *last_rid) {
                return Err(CoreError::invalid_operation(format!(
                    "bulk load into {} out of order at {key} {rid}",
                    self.index.uri()
                )));
            }
        }
        self.index.insert(opctx, key, rid, self.dups_allowed)?;
        self.last = Some((encoded, rid));
        self.added += 1;
        Ok(())
    }

    /// Finishes the load, returning the number of entries added.
    #[must_use]
    pub fn commit(self) -> u64 {
        tracing::debug!(uri = %self.index.uri(), added = self.added, "bulk load finished");
        self.added
    }
}
