//! # kvlayer Storage
//!
//! The embedded key-value engine capability consumed by kvlayer.
//!
//! This crate provides the lowest-level storage abstraction for kvlayer.
//! Engines are **opaque ordered byte stores** organised as named tables: they
//! know nothing about record stores, indexes or key encodings.
//!
//! ## Design Principles
//!
//! - An engine hands out sessions; sessions run transactions and open cursors
//! - Cursors are positioned iterators over one table, read through the
//!   owning session's transaction
//! - Engines must be `Send + Sync`; sessions and cursors are `Send`
//! - kvlayer owns all interpretation of keys and values
//!
//! ## Available Engines
//!
//! - [`InMemoryEngine`] - snapshot-isolated reference engine with an optional
//!   journal and checkpoint file
//!
//! ## Example
//!
//! ```rust
//! use kvlayer_storage::{InMemoryEngine, KvEngine};
//!
//! let engine = InMemoryEngine::open(None, "create").unwrap();
//! let mut session = engine.open_session().unwrap();
//! session.create("table:demo", "").unwrap();
//!
//! let mut cursor = session.open_cursor("table:demo").unwrap();
//! cursor.insert(b"k", b"v", true).unwrap();
//! assert_eq!(cursor.search(b"k").unwrap(), Some(b"v".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod journal;
mod memory;

pub use config::{ConfigValue, EngineConfig};
pub use engine::{KvCursor, KvEngine, KvSession, SearchNear};
pub use error::{EngineError, EngineResult};
pub use memory::InMemoryEngine;

/// Name of the checkpoint image written inside an engine home directory.
pub const CHECKPOINT_FILE: &str = "kv.checkpoint";

/// Name of the journal file written inside the configured log directory.
pub const JOURNAL_FILE: &str = "kv.journal";
