//! In-memory reference engine.

mod cursor;
mod session;

use crate::config::EngineConfig;
use crate::engine::{KvEngine, KvSession};
use crate::error::{EngineError, EngineResult};
use crate::journal::{
    load_checkpoint, save_checkpoint, CheckpointImage, Journal, JournalOp, JournalRecord,
    TableImage,
};
use crate::{CHECKPOINT_FILE, JOURNAL_FILE};
use parking_lot::{Mutex, RwLock};
use session::MemSession;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// An in-memory engine with snapshot-isolated transactions.
///
/// This engine keeps every table in memory and is suitable for:
/// - Unit and integration tests
/// - Ephemeral databases
/// - Small persistent databases, when opened with a home directory
///
/// # Transactions
///
/// A transaction reads from the snapshot taken at `begin_transaction` plus
/// its own uncommitted writes. Commit fails with `WriteConflict` if any key
/// it wrote was committed by someone else after the snapshot
/// (first committer wins).
///
/// # Persistence
///
/// With a home directory, `checkpoint` writes every table to
/// `<home>/kv.checkpoint`. If `log=(enabled=true)` is configured, every
/// commit is also appended to `<home>/<log.path>/kv.journal` and replayed on
/// the next open.
///
/// # Example
///
/// ```rust
/// use kvlayer_storage::{InMemoryEngine, KvEngine};
///
/// let engine = InMemoryEngine::open(None, "create").unwrap();
/// let mut session = engine.open_session().unwrap();
/// session.create("table:t", "").unwrap();
/// session.begin_transaction("").unwrap();
/// session.open_cursor("table:t").unwrap().insert(b"a", b"1", false).unwrap();
/// session.commit_transaction().unwrap();
/// ```
#[derive(Clone)]
pub struct InMemoryEngine {
    shared: Arc<Shared>,
}

/// State shared by the engine handle, its sessions and their cursors.
pub(crate) struct Shared {
    state: RwLock<EngineState>,
    /// Open cursors per table. Always locked before `state`.
    cursor_refs: Mutex<HashMap<String, usize>>,
    home: Option<PathBuf>,
    journal: Option<Mutex<Journal>>,
    closed: AtomicBool,
    next_session_id: AtomicU64,
    open_sessions: AtomicUsize,
}

#[derive(Debug, Default)]
pub(crate) struct EngineState {
    tables: BTreeMap<String, Arc<Table>>,
    commit_seq: u64,
}

/// One table: committed rows plus the commit sequence that last wrote each key.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    config: String,
    rows: BTreeMap<Vec<u8>, Vec<u8>>,
    versions: HashMap<Vec<u8>, u64>,
}

impl Table {
    fn size_bytes(&self) -> u64 {
        self.rows
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

/// Uncommitted writes per table: `None` marks a removal.
pub(crate) type WriteSet = BTreeMap<String, BTreeMap<Vec<u8>, Option<Vec<u8>>>>;

impl InMemoryEngine {
    /// Opens an engine.
    ///
    /// With `home`, the directory is created when `create` is configured,
    /// the last checkpoint is loaded and the journal replayed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a malformed configuration, `NotFound` if
    /// `home` is missing and `create` was not given, or I/O errors.
    pub fn open(home: Option<&Path>, config: &str) -> EngineResult<Self> {
        let parsed = EngineConfig::parse(config)?;
        let logging = parsed.get_bool("log.enabled")?.unwrap_or(false);

        let mut state = EngineState::default();
        let mut journal = None;

        if let Some(home) = home {
            if !home.exists() {
                if parsed.contains("create") {
                    std::fs::create_dir_all(home)?;
                } else {
                    return Err(EngineError::not_found(format!(
                        "engine home {}",
                        home.display()
                    )));
                }
            }

            if let Some(image) = load_checkpoint(&home.join(CHECKPOINT_FILE))? {
                state.commit_seq = image.commit_seq;
                for (uri, table) in image.tables {
                    state.tables.insert(
                        uri,
                        Arc::new(Table {
                            config: table.config,
                            rows: table.rows.into_iter().collect(),
                            versions: HashMap::new(),
                        }),
                    );
                }
            }

            if logging {
                let log_dir = parsed.get_str("log.path").unwrap_or(".");
                let log = Journal::open(&home.join(log_dir).join(JOURNAL_FILE))?;
                let mut replayed = 0usize;
                for record in log.read_all()? {
                    if record.seq <= state.commit_seq {
                        continue;
                    }
                    state.apply(&record)?;
                    replayed += 1;
                }
                if replayed > 0 {
                    tracing::info!(replayed, "replayed journal records");
                }
                journal = Some(Mutex::new(log));
            }
        }

        tracing::info!(
            home = ?home,
            tables = state.tables.len(),
            logging,
            "opened in-memory engine"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                cursor_refs: Mutex::new(HashMap::new()),
                home: home.map(Path::to_path_buf),
                journal,
                closed: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
                open_sessions: AtomicUsize::new(0),
            }),
        })
    }

    /// Returns the number of cursors currently referencing `uri`.
    #[must_use]
    pub fn cursor_refs(&self, uri: &str) -> usize {
        self.shared.cursor_refs.lock().get(uri).copied().unwrap_or(0)
    }

    /// Returns the latest commit sequence.
    #[must_use]
    pub fn commit_seq(&self) -> u64 {
        self.shared.state.read().commit_seq
    }

    /// Returns true once [`KvEngine::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl KvEngine for InMemoryEngine {
    fn open_session(&self) -> EngineResult<Box<dyn KvSession>> {
        self.shared.ensure_open()?;
        let id = self.shared.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.shared.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemSession::new(id, Arc::clone(&self.shared))))
    }

    fn close(&self) -> EngineResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.checkpoint()?;
        tracing::info!("closed in-memory engine");
        Ok(())
    }

    fn open_session_count(&self) -> usize {
        self.shared.open_sessions.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("home", &self.shared.home)
            .field("commit_seq", &self.commit_seq())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl EngineState {
    fn table(&self, uri: &str) -> EngineResult<&Arc<Table>> {
        self.tables
            .get(uri)
            .ok_or_else(|| EngineError::not_found(uri.to_string()))
    }

    fn table_mut(&mut self, uri: &str) -> EngineResult<&mut Table> {
        self.tables
            .get_mut(uri)
            .map(Arc::make_mut)
            .ok_or_else(|| EngineError::not_found(uri.to_string()))
    }

    /// Replays one journal record.
    fn apply(&mut self, record: &JournalRecord) -> EngineResult<()> {
        for op in &record.ops {
            match op {
                JournalOp::Create { uri, config } => {
                    self.tables.insert(
                        uri.clone(),
                        Arc::new(Table {
                            config: config.clone(),
                            ..Table::default()
                        }),
                    );
                }
                JournalOp::Drop { uri } => {
                    self.tables.remove(uri);
                }
                JournalOp::Put { uri, key, value } => {
                    self.table_mut(uri)?.rows.insert(key.clone(), value.clone());
                }
                JournalOp::Remove { uri, key } => {
                    self.table_mut(uri)?.rows.remove(key);
                }
            }
        }
        self.commit_seq = self.commit_seq.max(record.seq);
        Ok(())
    }
}

impl Shared {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn log(&self, record: &JournalRecord, sync: bool) -> EngineResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().append(record, sync)?;
        }
        Ok(())
    }

    /// Returns the committed version of a table.
    fn committed_table(&self, uri: &str) -> EngineResult<Arc<Table>> {
        self.state.read().table(uri).cloned()
    }

    fn create_table(&self, uri: &str, config: &str) -> EngineResult<()> {
        self.ensure_open()?;
        EngineConfig::parse(config)?;

        let mut state = self.state.write();
        if state.tables.contains_key(uri) {
            return Err(EngineError::AlreadyExists {
                uri: uri.to_string(),
            });
        }
        let seq = state.commit_seq + 1;
        self.log(
            &JournalRecord {
                seq,
                ops: vec![JournalOp::Create {
                    uri: uri.to_string(),
                    config: config.to_string(),
                }],
            },
            false,
        )?;
        state.tables.insert(
            uri.to_string(),
            Arc::new(Table {
                config: config.to_string(),
                ..Table::default()
            }),
        );
        state.commit_seq = seq;
        Ok(())
    }

    fn drop_table(&self, uri: &str, force: bool) -> EngineResult<()> {
        self.ensure_open()?;

        let refs = self.cursor_refs.lock();
        if refs.get(uri).copied().unwrap_or(0) > 0 {
            return Err(EngineError::Busy {
                uri: uri.to_string(),
            });
        }

        let mut state = self.state.write();
        if !state.tables.contains_key(uri) {
            return if force {
                Ok(())
            } else {
                Err(EngineError::not_found(uri.to_string()))
            };
        }
        let seq = state.commit_seq + 1;
        self.log(
            &JournalRecord {
                seq,
                ops: vec![JournalOp::Drop {
                    uri: uri.to_string(),
                }],
            },
            false,
        )?;
        state.tables.remove(uri);
        state.commit_seq = seq;
        Ok(())
    }

    /// Registers a cursor on `uri`, failing if the table is unknown.
    fn acquire_cursor_ref(&self, uri: &str, visible_in_snapshot: bool) -> EngineResult<()> {
        self.ensure_open()?;
        let mut refs = self.cursor_refs.lock();
        if !visible_in_snapshot && !self.state.read().tables.contains_key(uri) {
            return Err(EngineError::not_found(uri.to_string()));
        }
        *refs.entry(uri.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn release_cursor_ref(&self, uri: &str) {
        let mut refs = self.cursor_refs.lock();
        if let Some(count) = refs.get_mut(uri) {
            *count -= 1;
            if *count == 0 {
                refs.remove(uri);
            }
        }
    }

    /// Commits a write set.
    ///
    /// With a snapshot sequence, any key committed after it is a conflict.
    fn commit(&self, writes: WriteSet, snapshot_seq: Option<u64>, sync: bool) -> EngineResult<()> {
        self.ensure_open()?;
        if writes.values().all(BTreeMap::is_empty) {
            return Ok(());
        }

        let mut state = self.state.write();

        if let Some(snapshot_seq) = snapshot_seq {
            for (uri, keys) in &writes {
                let table = state.table(uri)?;
                let conflicted = keys.keys().any(|key| {
                    table
                        .versions
                        .get(key)
                        .is_some_and(|&written| written > snapshot_seq)
                });
                if conflicted {
                    return Err(EngineError::WriteConflict { uri: uri.clone() });
                }
            }
        }

        let seq = state.commit_seq + 1;
        let mut ops = Vec::new();
        for (uri, keys) in &writes {
            for (key, value) in keys {
                ops.push(match value {
                    Some(value) => JournalOp::Put {
                        uri: uri.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    },
                    None => JournalOp::Remove {
                        uri: uri.clone(),
                        key: key.clone(),
                    },
                });
            }
        }
        self.log(&JournalRecord { seq, ops }, sync)?;

        for (uri, keys) in writes {
            let table = state.table_mut(&uri)?;
            for (key, value) in keys {
                match value {
                    Some(value) => {
                        table.rows.insert(key.clone(), value);
                    }
                    None => {
                        table.rows.remove(&key);
                    }
                }
                table.versions.insert(key, seq);
            }
        }
        state.commit_seq = seq;
        Ok(())
    }

    fn log_flush(&self) -> EngineResult<()> {
        if let Some(journal) = &self.journal {
            journal.lock().sync()?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> EngineResult<()> {
        let Some(home) = &self.home else {
            return Ok(());
        };

        let image = {
            let state = self.state.read();
            CheckpointImage {
                commit_seq: state.commit_seq,
                tables: state
                    .tables
                    .iter()
                    .map(|(uri, table)| {
                        (
                            uri.clone(),
                            TableImage {
                                config: table.config.clone(),
                                rows: table
                                    .rows
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.clone()))
                                    .collect(),
                            },
                        )
                    })
                    .collect(),
            }
        };

        save_checkpoint(&home.join(CHECKPOINT_FILE), &image)?;
        if let Some(journal) = &self.journal {
            journal.lock().truncate()?;
        }
        tracing::debug!(commit_seq = image.commit_seq, "checkpoint written");
        Ok(())
    }
}
