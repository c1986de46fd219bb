use super::cursor::MemCursor;
use super::{Shared, Table, WriteSet};
use crate::config::EngineConfig;
use crate::engine::{KvCursor, KvSession};
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A read view fixed at `begin_transaction`.
pub(super) struct Snapshot {
    pub seq: u64,
    pub tables: BTreeMap<String, Arc<Table>>,
}

/// Transaction state shared by a session and every cursor it opened.
#[derive(Default)]
pub(super) struct TxnState {
    pub snapshot: Option<Snapshot>,
    pub writes: WriteSet,
    pub sync: bool,
}

impl TxnState {
    fn clear(&mut self) {
        self.snapshot = None;
        self.writes.clear();
        self.sync = false;
    }
}

pub(super) struct MemSession {
    id: u64,
    shared: Arc<Shared>,
    txn: Arc<Mutex<TxnState>>,
}

impl MemSession {
    pub(super) fn new(id: u64, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            txn: Arc::new(Mutex::new(TxnState::default())),
        }
    }

    /// Returns the table as this session sees it.
    fn view(&self, uri: &str) -> EngineResult<Arc<Table>> {
        let txn = self.txn.lock();
        if let Some(table) = txn.snapshot.as_ref().and_then(|s| s.tables.get(uri)) {
            return Ok(Arc::clone(table));
        }
        self.shared.committed_table(uri)
    }
}

impl KvSession for MemSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn create(&mut self, uri: &str, config: &str) -> EngineResult<()> {
        self.shared.create_table(uri, config)
    }

    fn drop_table(&mut self, uri: &str, config: &str) -> EngineResult<()> {
        let force = EngineConfig::parse(config)?.contains("force");
        self.shared.drop_table(uri, force)
    }

    fn table_exists(&self, uri: &str) -> EngineResult<bool> {
        self.shared.ensure_open()?;
        Ok(self.shared.state.read().tables.contains_key(uri))
    }

    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn KvCursor>> {
        let in_snapshot = self
            .txn
            .lock()
            .snapshot
            .as_ref()
            .is_some_and(|s| s.tables.contains_key(uri));
        self.shared.acquire_cursor_ref(uri, in_snapshot)?;
        Ok(Box::new(MemCursor::new(
            uri.to_string(),
            Arc::clone(&self.shared),
            Arc::clone(&self.txn),
        )))
    }

    fn begin_transaction(&mut self, config: &str) -> EngineResult<()> {
        self.shared.ensure_open()?;
        let sync = EngineConfig::parse(config)?
            .get_bool("sync")?
            .unwrap_or(false);

        let mut txn = self.txn.lock();
        if txn.snapshot.is_some() {
            return Err(EngineError::invalid_state(format!(
                "session {} already has a running transaction",
                self.id
            )));
        }
        let state = self.shared.state.read();
        txn.snapshot = Some(Snapshot {
            seq: state.commit_seq,
            tables: state.tables.clone(),
        });
        txn.writes.clear();
        txn.sync = sync;
        Ok(())
    }

    fn commit_transaction(&mut self) -> EngineResult<()> {
        let mut txn = self.txn.lock();
        let Some(snapshot) = txn.snapshot.take() else {
            return Err(EngineError::invalid_state(format!(
                "session {} has no running transaction",
                self.id
            )));
        };
        let writes = std::mem::take(&mut txn.writes);
        let sync = txn.sync;
        txn.clear();
        drop(txn);

        let result = self.shared.commit(writes, Some(snapshot.seq), sync);
        if let Err(err) = &result {
            tracing::debug!(
                session = self.id,
                error = %err,
                "commit failed, transaction rolled back"
            );
        }
        result
    }

    fn rollback_transaction(&mut self) -> EngineResult<()> {
        let mut txn = self.txn.lock();
        if txn.snapshot.is_none() {
            return Err(EngineError::invalid_state(format!(
                "session {} has no running transaction",
                self.id
            )));
        }
        txn.clear();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.lock().snapshot.is_some()
    }

    fn checkpoint(&mut self) -> EngineResult<()> {
        self.shared.ensure_open()?;
        self.shared.checkpoint()
    }

    fn log_flush(&mut self) -> EngineResult<()> {
        self.shared.ensure_open()?;
        self.shared.log_flush()
    }

    fn compact(&mut self, uri: &str) -> EngineResult<()> {
        self.shared.ensure_open()?;
        self.shared.committed_table(uri)?;
        tracing::debug!(uri, "compact requested; in-memory tables are always compact");
        Ok(())
    }

    fn verify(&mut self, uri: &str) -> EngineResult<u64> {
        self.shared.ensure_open()?;
        let table = self.view(uri)?;
        let mut previous: Option<&Vec<u8>> = None;
        for key in table.rows.keys() {
            if previous.is_some_and(|p| p >= key) {
                return Err(EngineError::Corrupted(format!("{uri}: keys out of order")));
            }
            previous = Some(key);
        }
        Ok(table.rows.len() as u64)
    }

    fn table_size(&self, uri: &str) -> EngineResult<u64> {
        self.shared.ensure_open()?;
        Ok(self.view(uri)?.size_bytes())
    }

    fn list_tables(&self, prefix: &str) -> EngineResult<Vec<String>> {
        self.shared.ensure_open()?;
        Ok(self
            .shared
            .state
            .read()
            .tables
            .keys()
            .filter(|uri| uri.starts_with(prefix))
            .cloned()
            .collect())
    }
}

impl Drop for MemSession {
    fn drop(&mut self) {
        let mut txn = self.txn.lock();
        if txn.snapshot.is_some() {
            tracing::debug!(session = self.id, "session dropped with running transaction");
        }
        txn.clear();
        self.shared.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
