use super::session::TxnState;
use super::{Shared, Table, WriteSet};
use crate::engine::{KvCursor, SearchNear};
use crate::error::{EngineError, EngineResult};
use crate::journal::{JournalOp, JournalRecord};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

pub(super) struct MemCursor {
    uri: String,
    shared: Arc<Shared>,
    txn: Arc<Mutex<TxnState>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl MemCursor {
    pub(super) fn new(uri: String, shared: Arc<Shared>, txn: Arc<Mutex<TxnState>>) -> Self {
        Self {
            uri,
            shared,
            txn,
            current: None,
        }
    }

    fn base_table(&self, txn: &TxnState) -> EngineResult<Arc<Table>> {
        if let Some(table) = txn.snapshot.as_ref().and_then(|s| s.tables.get(&self.uri)) {
            return Ok(Arc::clone(table));
        }
        self.shared.committed_table(&self.uri)
    }

    /// Returns the value visible to this cursor's transaction.
    fn visible(&self, txn: &TxnState, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        if let Some(pending) = txn.writes.get(&self.uri).and_then(|o| o.get(key)) {
            return Ok(pending.clone());
        }
        Ok(self.base_table(txn)?.rows.get(key).cloned())
    }

    fn step_from(&mut self, from: Bound<&[u8]>, forward: bool) -> EngineResult<bool> {
        self.shared.ensure_open()?;
        let txn = self.txn.lock();
        let table = self.base_table(&txn)?;
        let found = step(&table, txn.writes.get(&self.uri), from, forward);
        drop(txn);
        self.current = found;
        Ok(self.current.is_some())
    }

    fn advance(&mut self, forward: bool) -> EngineResult<bool> {
        match self.current.take() {
            Some((key, _)) => self.step_from(Bound::Excluded(key.as_slice()), forward),
            None => self.step_from(Bound::Unbounded, forward),
        }
    }
}

/// Finds the next visible entry after `from` in the merged view of the
/// committed table and the uncommitted overlay.
fn step(
    table: &Table,
    overlay: Option<&Overlay>,
    from: Bound<&[u8]>,
    forward: bool,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let empty = Overlay::new();
    let overlay = overlay.unwrap_or(&empty);
    let range = if forward {
        (from, Bound::Unbounded)
    } else {
        (Bound::Unbounded, from)
    };

    let mut base: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)> + '_> = if forward {
        Box::new(table.rows.range::<[u8], _>(range))
    } else {
        Box::new(table.rows.range::<[u8], _>(range).rev())
    };
    let mut pending: Box<dyn Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> + '_> = if forward {
        Box::new(overlay.range::<[u8], _>(range))
    } else {
        Box::new(overlay.range::<[u8], _>(range).rev())
    };

    let mut b = base.next();
    let mut p = pending.next();
    loop {
        match (b, p) {
            (None, None) => return None,
            (Some((k, v)), None) => return Some((k.clone(), v.clone())),
            (None, Some((k, v))) => match v {
                Some(v) => return Some((k.clone(), v.clone())),
                None => p = pending.next(),
            },
            (Some((bk, bv)), Some((pk, pv))) => {
                let order = bk.cmp(pk);
                let base_first = if forward {
                    order == Ordering::Less
                } else {
                    order == Ordering::Greater
                };
                if base_first {
                    return Some((bk.clone(), bv.clone()));
                }
                if order == Ordering::Equal {
                    b = base.next();
                }
                match pv {
                    Some(v) => return Some((pk.clone(), v.clone())),
                    None => p = pending.next(),
                }
            }
        }
    }
}

enum AutoWrite<'a> {
    Insert { value: &'a [u8], overwrite: bool },
    Remove,
}

impl Shared {
    /// Applies a single write outside any transaction.
    fn autocommit(&self, uri: &str, key: &[u8], write: AutoWrite<'_>) -> EngineResult<()> {
        self.ensure_open()?;
        let mut state = self.state.write();
        let exists = state.table(uri)?.rows.contains_key(key);
        let op = match write {
            AutoWrite::Insert { overwrite, .. } if exists && !overwrite => {
                return Err(EngineError::DuplicateKey {
                    uri: uri.to_string(),
                })
            }
            AutoWrite::Remove if !exists => {
                return Err(EngineError::not_found(format!("key in {uri}")))
            }
            AutoWrite::Insert { value, .. } => JournalOp::Put {
                uri: uri.to_string(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
            AutoWrite::Remove => JournalOp::Remove {
                uri: uri.to_string(),
                key: key.to_vec(),
            },
        };

        let seq = state.commit_seq + 1;
        self.log(
            &JournalRecord {
                seq,
                ops: vec![op.clone()],
            },
            false,
        )?;
        let table = state.table_mut(uri)?;
        match op {
            JournalOp::Put { key, value, .. } => {
                table.rows.insert(key.clone(), value);
                table.versions.insert(key, seq);
            }
            JournalOp::Remove { key, .. } => {
                table.rows.remove(&key);
                table.versions.insert(key, seq);
            }
            JournalOp::Create { .. } | JournalOp::Drop { .. } => {}
        }
        state.commit_seq = seq;
        Ok(())
    }
}

impl KvCursor for MemCursor {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn search(&mut self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        self.shared.ensure_open()?;
        let txn = self.txn.lock();
        let found = self.visible(&txn, key)?;
        drop(txn);
        self.current = found.clone().map(|v| (key.to_vec(), v));
        Ok(found)
    }

    fn search_near(&mut self, key: &[u8]) -> EngineResult<Option<SearchNear>> {
        if self.search(key)?.is_some() {
            return Ok(Some(SearchNear::Exact));
        }
        if self.step_from(Bound::Excluded(key), true)? {
            return Ok(Some(SearchNear::Greater));
        }
        if self.step_from(Bound::Excluded(key), false)? {
            return Ok(Some(SearchNear::Less));
        }
        Ok(None)
    }

    fn next(&mut self) -> EngineResult<bool> {
        self.advance(true)
    }

    fn prev(&mut self) -> EngineResult<bool> {
        self.advance(false)
    }

    fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    fn insert(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> EngineResult<()> {
        self.shared.ensure_open()?;
        let mut txn = self.txn.lock();
        if txn.snapshot.is_none() {
            drop(txn);
            self.shared
                .autocommit(&self.uri, key, AutoWrite::Insert { value, overwrite })?;
        } else {
            if !overwrite && self.visible(&txn, key)?.is_some() {
                return Err(EngineError::DuplicateKey {
                    uri: self.uri.clone(),
                });
            }
            let writes: &mut WriteSet = &mut txn.writes;
            writes
                .entry(self.uri.clone())
                .or_default()
                .insert(key.to_vec(), Some(value.to_vec()));
        }
        self.current = Some((key.to_vec(), value.to_vec()));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> EngineResult<()> {
        self.shared.ensure_open()?;
        let mut txn = self.txn.lock();
        if txn.snapshot.is_none() {
            drop(txn);
            self.shared.autocommit(&self.uri, key, AutoWrite::Remove)?;
        } else {
            if self.visible(&txn, key)?.is_none() {
                return Err(EngineError::not_found(format!("key in {}", self.uri)));
            }
            txn.writes
                .entry(self.uri.clone())
                .or_default()
                .insert(key.to_vec(), None);
        }
        self.current = None;
        Ok(())
    }
}

impl Drop for MemCursor {
    fn drop(&mut self) {
        self.shared.release_cursor_ref(&self.uri);
    }
}
