//! Positioned iteration over a sorted index.
//!
//! Positioning works on logical entries `encode(key) ‖ rid`. The engine
//! cursor is first placed on the last row at or before the target, then the
//! entries of that row and its neighbours are scanned for the first (or, for
//! a backward cursor, last) entry on the wanted side of the target.

use super::key::{encode_fields, IndexKey, KeyField};
use super::SortedIndex;
use crate::cursor::CursorHandle;
use crate::error::{CoreError, CoreResult};
use crate::operation_context::OperationContext;
use crate::types::RecordId;
use kvlayer_storage::SearchNear;
use std::cmp::Ordering;

/// Suffix sorting after every entry that starts with a given encoded prefix.
const HIGH_SUFFIX: [u8; RecordId::ENCODED_LEN + 1] = [0xFF; RecordId::ENCODED_LEN + 1];

#[derive(Debug, Clone)]
struct Entry {
    key: IndexKey,
    encoded: Vec<u8>,
    rid: RecordId,
}

impl Entry {
    fn logical(&self) -> Vec<u8> {
        logical(&self.encoded, self.rid)
    }
}

fn logical(encoded: &[u8], rid: RecordId) -> Vec<u8> {
    let mut bytes = encoded.to_vec();
    bytes.extend_from_slice(&rid.to_key());
    bytes
}

fn with_high_suffix(encoded: &[u8]) -> Vec<u8> {
    let mut bytes = encoded.to_vec();
    bytes.extend_from_slice(&HIGH_SUFFIX);
    bytes
}

#[derive(Debug, Clone)]
enum Saved {
    Eof,
    At { encoded: Vec<u8>, rid: RecordId },
}

/// A forward or backward cursor over a [`SortedIndex`].
///
/// A new cursor is at EOF until positioned with [`locate`](Self::locate)
/// or [`custom_locate`](Self::custom_locate).
pub struct IndexCursor {
    index: SortedIndex,
    forward: bool,
    handle: Option<CursorHandle>,
    row: Vec<Entry>,
    pos: usize,
    eof: bool,
    saved: Option<Saved>,
}

impl IndexCursor {
    pub(super) fn new(
        index: SortedIndex,
        opctx: &mut OperationContext,
        forward: bool,
    ) -> CoreResult<Self> {
        let handle = index.open_handle(opctx)?;
        Ok(Self {
            index,
            forward,
            handle: Some(handle),
            row: Vec::new(),
            pos: 0,
            eof: true,
            saved: None,
        })
    }

    /// Returns true for a forward cursor.
    #[must_use]
    pub fn is_forward(&self) -> bool {
        self.forward
    }

    /// Returns true if the cursor is not on an entry.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Returns the key of the current entry.
    #[must_use]
    pub fn get_key(&self) -> Option<&IndexKey> {
        self.current().map(|e| &e.key)
    }

    /// Returns the record id of the current entry.
    #[must_use]
    pub fn get_record_id(&self) -> Option<RecordId> {
        self.current().map(|e| e.rid)
    }

    /// Returns true if both cursors are on the same entry, or both at EOF.
    #[must_use]
    pub fn points_to_same_place_as(&self, other: &IndexCursor) -> bool {
        match (self.current(), other.current()) {
            (None, None) => true,
            (Some(a), Some(b)) => a.encoded == b.encoded && a.rid == b.rid,
            _ => false,
        }
    }

    fn current(&self) -> Option<&Entry> {
        if self.eof {
            None
        } else {
            self.row.get(self.pos)
        }
    }

    fn handle(&mut self) -> CoreResult<&mut CursorHandle> {
        match self.handle.as_mut() {
            Some(handle) => Ok(handle),
            None => Err(CoreError::invalid_operation(format!(
                "index cursor on {} is saved; restore it first",
                self.index.uri()
            ))),
        }
    }

    fn set_eof(&mut self) {
        self.eof = true;
        self.row.clear();
        self.pos = 0;
    }

    /// Decodes the entries of the engine row under the cursor, ascending.
    fn load_row(&mut self) -> CoreResult<Vec<Entry>> {
        let kind = self.index.kind();
        let fields = self.index.field_count();
        let handle = self.handle()?;
        let (Some(row_key), Some(value)) = (handle.key(), handle.value()) else {
            return Err(CoreError::invalid_operation("index cursor lost its position"));
        };
        let encoded = kind.row_encoded_key(row_key).to_vec();
        let (key, used) = IndexKey::decode_prefix(&encoded, fields)?;
        if used != encoded.len() {
            return Err(CoreError::type_mismatch("trailing bytes in index entry"));
        }
        let rids = kind.row_rids(row_key, value)?;
        Ok(rids
            .into_iter()
            .map(|rid| Entry {
                key: key.clone(),
                encoded: encoded.clone(),
                rid,
            })
            .collect())
    }

    /// Places the engine cursor on the last row at or before `target`.
    /// Returns false if no such row exists.
    fn position_at_or_before(&mut self, target: &[u8]) -> CoreResult<bool> {
        let handle = self.handle()?;
        Ok(match handle.search_near(target)? {
            None => false,
            Some(SearchNear::Exact | SearchNear::Less) => true,
            Some(SearchNear::Greater) => handle.prev()?,
        })
    }

    /// Moves to the first entry at or after `target` (strictly after when
    /// not `inclusive`).
    fn seek_forward(&mut self, target: &[u8], inclusive: bool) -> CoreResult<()> {
        let wanted = |e: &Entry| match e.logical().as_slice().cmp(target) {
            Ordering::Greater => true,
            Ordering::Equal => inclusive,
            Ordering::Less => false,
        };
        if !self.position_at_or_before(target)? && !self.handle()?.next()? {
            self.set_eof();
            return Ok(());
        }
        loop {
            let row = self.load_row()?;
            if let Some(i) = row.iter().position(wanted) {
                self.land(row, i);
                return Ok(());
            }
            if !self.handle()?.next()? {
                self.set_eof();
                return Ok(());
            }
        }
    }

    /// Moves to the last entry at or before `target` (strictly before when
    /// not `inclusive`).
    fn seek_backward(&mut self, target: &[u8], inclusive: bool) -> CoreResult<()> {
        let wanted = |e: &Entry| match e.logical().as_slice().cmp(target) {
            Ordering::Less => true,
            Ordering::Equal => inclusive,
            Ordering::Greater => false,
        };
        if !self.position_at_or_before(target)? {
            self.set_eof();
            return Ok(());
        }
        loop {
            let row = self.load_row()?;
            if let Some(i) = row.iter().rposition(wanted) {
                self.land(row, i);
                return Ok(());
            }
            if !self.handle()?.prev()? {
                self.set_eof();
                return Ok(());
            }
        }
    }

    fn land(&mut self, row: Vec<Entry>, pos: usize) {
        self.row = row;
        self.pos = pos;
        self.eof = false;
    }

    /// Positions on `(key, loc)` or the nearest entry in cursor direction.
    ///
    /// Returns true if the cursor landed on `key` with record `loc`. The
    /// [`RecordId::min`] and [`RecordId::max`] sentinels match any record of
    /// `key`.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the table is gone, or `InvalidOperation`
    /// while the position is saved.
    pub fn locate(&mut self, key: &IndexKey, loc: RecordId) -> CoreResult<bool> {
        let encoded = key.encode();
        let target = logical(&encoded, loc);
        if self.forward {
            self.seek_forward(&target, true)?;
        } else {
            self.seek_backward(&target, true)?;
        }
        Ok(self
            .current()
            .is_some_and(|e| e.encoded == encoded && (e.rid == loc || !loc.is_normal())))
    }

    /// Positions on the first entry, in cursor direction, that satisfies a
    /// bound made of the first `key_begin_len` fields of `key_begin` followed
    /// by the remaining fields of `key_end`.
    ///
    /// With `after_key`, only the prefix is used and entries sharing it are
    /// skipped. Otherwise the bound extends through `key_end` up to the
    /// first field whose `key_end_inclusive` flag is false; an exclusive
    /// field skips entries equal to the bound.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the bound does not match the index
    /// width.
    pub fn custom_locate(
        &mut self,
        key_begin: &IndexKey,
        key_begin_len: usize,
        after_key: bool,
        key_end: &[KeyField],
        key_end_inclusive: &[bool],
    ) -> CoreResult<()> {
        let (encoded, exclusive) =
            self.seek_bound(key_begin, key_begin_len, after_key, key_end, key_end_inclusive)?;
        let high = with_high_suffix(&encoded);
        match (self.forward, exclusive) {
            (true, true) => self.seek_forward(&high, false),
            (true, false) => self.seek_forward(&encoded, true),
            (false, true) => self.seek_backward(&encoded, false),
            (false, false) => self.seek_backward(&high, false),
        }
    }

    /// Skips ahead to the first entry satisfying the bound. Same arguments
    /// as [`custom_locate`](Self::custom_locate).
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the bound does not match the index
    /// width.
    pub fn advance_to(
        &mut self,
        key_begin: &IndexKey,
        key_begin_len: usize,
        after_key: bool,
        key_end: &[KeyField],
        key_end_inclusive: &[bool],
    ) -> CoreResult<()> {
        self.custom_locate(key_begin, key_begin_len, after_key, key_end, key_end_inclusive)
    }

    fn seek_bound(
        &self,
        key_begin: &IndexKey,
        key_begin_len: usize,
        after_key: bool,
        key_end: &[KeyField],
        key_end_inclusive: &[bool],
    ) -> CoreResult<(Vec<u8>, bool)> {
        let width = self.index.field_count();
        if key_begin_len > key_begin.len()
            || key_begin_len > width
            || key_end.len() != width
            || key_end_inclusive.len() != width
        {
            return Err(CoreError::invalid_operation(format!(
                "bound does not match the {width} fields of {}",
                self.index.uri()
            )));
        }

        let mut fields = key_begin.fields()[..key_begin_len].to_vec();
        if after_key {
            return Ok((encode_fields(&fields), true));
        }
        for i in key_begin_len..width {
            fields.push(key_end[i].clone());
            if !key_end_inclusive[i] {
                return Ok((encode_fields(&fields), true));
            }
        }
        Ok((encode_fields(&fields), false))
    }

    /// Moves to the next entry in cursor direction. No-op at EOF.
    ///
    /// # Errors
    ///
    /// Returns an engine error, or `InvalidOperation` while the position is
    /// saved.
    pub fn advance(&mut self) -> CoreResult<()> {
        if self.eof {
            return Ok(());
        }
        if self.forward {
            if self.pos + 1 < self.row.len() {
                self.pos += 1;
                return Ok(());
            }
            if !self.handle()?.next()? {
                self.set_eof();
                return Ok(());
            }
            let row = self.load_row()?;
            self.land(row, 0);
        } else {
            if self.pos > 0 {
                self.pos -= 1;
                return Ok(());
            }
            if !self.handle()?.prev()? {
                self.set_eof();
                return Ok(());
            }
            let row = self.load_row()?;
            let last = row.len().saturating_sub(1);
            self.land(row, last);
        }
        Ok(())
    }

    /// Remembers the logical position and releases the engine cursor.
    pub fn save_position(&mut self) {
        self.saved = Some(match self.current() {
            Some(entry) => Saved::At {
                encoded: entry.encoded.clone(),
                rid: entry.rid,
            },
            None => Saved::Eof,
        });
        self.handle = None;
        self.row.clear();
    }

    /// Reacquires an engine cursor from the operation's recovery unit and
    /// returns to the saved entry. If that entry was removed meanwhile, the
    /// cursor lands on its nearest successor in cursor direction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the table is gone.
    pub fn restore_position(&mut self, opctx: &mut OperationContext) -> CoreResult<()> {
        self.handle = Some(self.index.open_handle(opctx)?);
        match self.saved.take() {
            None | Some(Saved::Eof) => {
                if !self.eof {
                    self.set_eof();
                }
                Ok(())
            }
            Some(Saved::At { encoded, rid }) => {
                let target = logical(&encoded, rid);
                if self.forward {
                    self.seek_forward(&target, true)
                } else {
                    self.seek_backward(&target, true)
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCursor")
            .field("uri", &self.index.uri())
            .field("forward", &self.forward)
            .field("kind", &self.index.kind())
            .field("eof", &self.eof)
            .field("saved", &self.saved.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{insert_all, k, rid, setup};
    use super::*;
    use crate::operation_context::WriteUnitOfWork;

    fn collect(cursor: &mut IndexCursor) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        while let (Some(key), Some(id)) = (cursor.get_key(), cursor.get_record_id()) {
            out.push((key.to_string(), id.as_u64()));
            cursor.advance().unwrap();
        }
        out
    }

    fn entries(pairs: &[(&str, u64)]) -> Vec<(String, u64)> {
        pairs
            .iter()
            .map(|(s, id)| (k(s).to_string(), *id))
            .collect()
    }

    #[test]
    fn unique_with_dups_iterates_in_rid_order() {
        let (mut opctx, index) = setup(true);
        {
            let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
            index.insert(&mut wuow, &k("a"), rid(1), false).unwrap();
            let err = index.insert(&mut wuow, &k("a"), rid(2), false).unwrap_err();
            assert!(err.is_duplicate_key());
            index.insert(&mut wuow, &k("a"), rid(2), true).unwrap();
            wuow.commit().unwrap();
        }

        let mut cursor = index.new_cursor(&mut opctx, true).unwrap();
        assert!(cursor.is_eof());
        assert!(cursor.locate(&k("a"), RecordId::min()).unwrap());
        assert_eq!(collect(&mut cursor), entries(&[("a", 1), ("a", 2)]));
        assert!(cursor.is_eof());
    }

    #[test]
    fn locate_both_directions() {
        for unique in [false, true] {
            let (mut opctx, index) = setup(unique);
            insert_all(&mut opctx, &index, &[("a", 1), ("c", 3), ("c", 4), ("e", 5)]);
            let label = format!("{:?}", index.kind());

            let mut fwd = index.new_cursor(&mut opctx, true).unwrap();
            assert!(!fwd.locate(&k("b"), RecordId::min()).unwrap(), "{label}");
            assert_eq!(fwd.get_record_id(), Some(rid(3)), "{label}");
            assert!(fwd.locate(&k("c"), rid(4)).unwrap(), "{label}");
            assert_eq!(collect(&mut fwd), entries(&[("c", 4), ("e", 5)]), "{label}");

            let mut bwd = index.new_cursor(&mut opctx, false).unwrap();
            assert!(bwd.locate(&k("c"), RecordId::max()).unwrap(), "{label}");
            assert_eq!(
                collect(&mut bwd),
                entries(&[("c", 4), ("c", 3), ("a", 1)]),
                "{label}"
            );

            assert!(!bwd.locate(&k("0"), RecordId::max()).unwrap(), "{label}");
            assert!(bwd.is_eof(), "{label}");
            assert!(!fwd.locate(&k("z"), RecordId::min()).unwrap(), "{label}");
            assert!(fwd.is_eof(), "{label}");
        }
    }

    #[test]
    fn empty_index_is_eof() {
        let (mut opctx, index) = setup(false);
        let mut cursor = index.new_cursor(&mut opctx, true).unwrap();
        assert!(!cursor.locate(&k(""), RecordId::min()).unwrap());
        assert!(cursor.is_eof());
        cursor.advance().unwrap();
        assert!(cursor.is_eof());
    }

    #[test]
    fn custom_locate_bounds() {
        let (mut opctx, index) = setup(false);
        insert_all(&mut opctx, &index, &[("a", 1), ("b", 2), ("b", 3), ("c", 4)]);
        let b = [KeyField::from("b")];

        let mut fwd = index.new_cursor(&mut opctx, true).unwrap();
        fwd.custom_locate(&IndexKey::default(), 0, false, &b, &[true]).unwrap();
        assert_eq!(fwd.get_record_id(), Some(rid(2)));
        fwd.custom_locate(&IndexKey::default(), 0, false, &b, &[false]).unwrap();
        assert_eq!(fwd.get_record_id(), Some(rid(4)));
        fwd.custom_locate(&k("b"), 1, true, &b, &[true]).unwrap();
        assert_eq!(fwd.get_record_id(), Some(rid(4)));

        let mut bwd = index.new_cursor(&mut opctx, false).unwrap();
        bwd.custom_locate(&IndexKey::default(), 0, false, &b, &[true]).unwrap();
        assert_eq!(bwd.get_record_id(), Some(rid(3)));
        bwd.custom_locate(&IndexKey::default(), 0, false, &b, &[false]).unwrap();
        assert_eq!(bwd.get_record_id(), Some(rid(1)));
        bwd.advance_to(&k("b"), 1, true, &b, &[true]).unwrap();
        assert_eq!(bwd.get_record_id(), Some(rid(1)));

        assert!(fwd.custom_locate(&k("b"), 1, false, &[], &[]).is_err());
    }

    #[test]
    fn save_restore_skips_removed_entry() {
        let (mut opctx, index) = setup(false);
        insert_all(&mut opctx, &index, &[("a", 1), ("b", 2), ("c", 3)]);

        let mut cursor = index.new_cursor(&mut opctx, true).unwrap();
        assert!(cursor.locate(&k("b"), rid(2)).unwrap());
        cursor.save_position();
        assert!(cursor.advance().is_err());

        let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
        index.unindex(&mut wuow, &k("b"), rid(2), false).unwrap();
        wuow.commit().unwrap();

        cursor.restore_position(&mut opctx).unwrap();
        assert_eq!(cursor.get_record_id(), Some(rid(3)));
    }

    #[test]
    fn save_restore_at_eof_stays_eof() {
        let (mut opctx, index) = setup(false);
        let mut cursor = index.new_cursor(&mut opctx, true).unwrap();
        cursor.save_position();
        insert_all(&mut opctx, &index, &[("a", 1)]);
        cursor.restore_position(&mut opctx).unwrap();
        assert!(cursor.is_eof());
    }

    #[test]
    fn same_place() {
        let (mut opctx, index) = setup(true);
        insert_all(&mut opctx, &index, &[("a", 1), ("b", 2)]);
        let mut one = index.new_cursor(&mut opctx, true).unwrap();
        let mut two = index.new_cursor(&mut opctx, true).unwrap();
        assert!(one.points_to_same_place_as(&two));
        one.locate(&k("a"), rid(1)).unwrap();
        two.locate(&k("a"), RecordId::min()).unwrap();
        assert!(one.points_to_same_place_as(&two));
        two.advance().unwrap();
        assert!(!one.points_to_same_place_as(&two));
    }
}
