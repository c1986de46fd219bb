//! Error types for engine operations.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors returned by an engine, session or cursor.
///
/// These play the role of engine return codes. The adaptation layer maps
/// them onto its own taxonomy; anything it does not expect is fatal there.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The table is referenced by open cursors and cannot be dropped yet.
    #[error("resource busy: {uri}")]
    Busy {
        /// The table that is still referenced.
        uri: String,
    },

    /// The requested table or key does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A table with this name already exists.
    #[error("already exists: {uri}")]
    AlreadyExists {
        /// The table name.
        uri: String,
    },

    /// An insert without overwrite found the key already present.
    #[error("duplicate key in {uri}")]
    DuplicateKey {
        /// The table the insert targeted.
        uri: String,
    },

    /// Another transaction committed a conflicting write first.
    #[error("write conflict on {uri}")]
    WriteConflict {
        /// The table where the conflict was detected.
        uri: String,
    },

    /// A configuration string could not be parsed or is not supported.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The call is not valid in the current session or cursor state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The journal or checkpoint image is unreadable.
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// The engine has been closed.
    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Returns true for [`EngineError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true for [`EngineError::Busy`].
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}
