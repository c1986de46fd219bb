//! # kvlayer Core
//!
//! Transactional adaptation layer binding an embedded key-value engine to
//! per-operation execution contexts.
//!
//! This crate provides:
//! - [`EngineConnection`]: the process-wide engine handle, resource lifecycle
//!   and deferred drops
//! - [`SessionPool`] and [`CursorHandle`]: pooled engine sessions and cached cursors
//! - [`RecoveryUnit`]: nested units of work with commit/rollback callbacks
//! - [`RecordStore`] and [`SortedIndex`]: record and index contracts over engine tables
//! - [`SizeStorer`]: best-effort persisted record counts and data sizes
//! - [`OperationContext`]: per-operation state and cooperative interruption
//!
//! ## Example
//!
//! ```rust
//! use kvlayer_core::{
//!     CollectionOptions, EngineConnection, EngineOptions, OperationContext, ProcessContext,
//!     WriteUnitOfWork,
//! };
//! use std::sync::Arc;
//!
//! let conn = EngineConnection::open_in_memory(EngineOptions::new()).unwrap();
//! conn.create_record_store("r1", &CollectionOptions::default()).unwrap();
//! let store = conn.get_record_store("r1", &CollectionOptions::default());
//!
//! let process = ProcessContext::new(Arc::new(conn));
//! let mut opctx = OperationContext::new(process, 1);
//!
//! let mut wuow = WriteUnitOfWork::new(&mut opctx).unwrap();
//! let id = store.insert_record(&mut wuow, b"hello").unwrap();
//! wuow.commit().unwrap();
//!
//! assert_eq!(store.find_record(&mut opctx, id).unwrap(), Some(b"hello".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod cursor;
mod dir;
mod error;
mod ident;
pub mod index;
mod lock;
mod maintenance;
mod operation_context;
mod process;
mod record_store;
mod recovery_unit;
mod session_pool;
mod size_storer;
mod types;

pub use config::{default_cache_size_gb, CollectionOptions, EngineOptions, IndexDescriptor};
pub use connection::EngineConnection;
pub use cursor::{CursorCache, CursorHandle};
pub use dir::{EngineDir, JOURNAL_DIR};
pub use error::{fatal, invariant, invariant_ok, CoreError, CoreResult};
pub use ident::{ident_of, resource_uri, SIZE_STORER_URI, TABLE_PREFIX};
pub use index::{
    BulkBuilder, IndexCursor, IndexKey, IndexKind, KeyField, SortedIndex, MAX_KEY_BYTES,
};
pub use lock::{LockGranularity, LockManager, LockMode, Locker, LockerImpl};
pub use maintenance::MaintenanceWorker;
pub use operation_context::{InterruptReason, OperationContext, WriteUnitOfWork};
pub use process::{
    CurOp, IdGenerator, InterruptFailPoint, InterruptFailPointConfig, OperationRegistry,
    ProcessContext,
};
pub use record_store::{RecordCursor, RecordStore, ValidateResults};
pub use recovery_unit::{Change, FnChange, RecoveryUnit, RecoveryUnitState};
pub use session_pool::{PooledSession, SessionPool};
pub use size_storer::{ElapsedTracker, SizeInfo, SizeStorer, SIZE_STORER_CONFIG};
pub use types::{OperationId, RecordId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
