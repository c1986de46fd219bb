//! Error types for kvlayer core.

use kvlayer_storage::{EngineError, EngineResult};
use std::fmt::Display;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in kvlayer core operations.
///
/// Conditions the layer cannot continue past (unexpected engine return
/// codes, session exhaustion, broken invariants) are not represented here:
/// they go through [`fatal`] and [`invariant_ok`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// Engine error with no dedicated mapping.
    #[error("engine error: {0}")]
    Engine(#[source] EngineError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A drop or rename target is still referenced by open cursors.
    #[error("resource busy: {uri}")]
    ResourceBusy {
        /// The engine resource name.
        uri: String,
    },

    /// Another transaction committed a conflicting write first.
    ///
    /// The unit of work has been aborted; retry the whole operation.
    #[error("write conflict on {uri}")]
    WriteConflict {
        /// The engine resource name.
        uri: String,
    },

    /// A unique index already holds the key for another record.
    #[error("duplicate key in {uri}: {key}")]
    DuplicateKey {
        /// The index resource name.
        uri: String,
        /// Rendering of the conflicting key.
        key: String,
    },

    /// An index key exceeds the size limit.
    #[error("key too long for {uri}: {len} bytes (max {max})")]
    KeyTooLong {
        /// The index resource name.
        uri: String,
        /// Encoded key length.
        len: usize,
        /// Maximum encoded key length.
        max: usize,
    },

    /// An engine resource does not exist.
    #[error("resource not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// An engine resource already exists.
    #[error("resource already exists: {uri}")]
    AlreadyExists {
        /// The engine resource name.
        uri: String,
    },

    /// An expected metadata document is absent.
    #[error("no matching document: {message}")]
    NoMatchingDocument {
        /// Description of the missing document.
        message: String,
    },

    /// An expected key or record is absent.
    #[error("no such key: {message}")]
    NoSuchKey {
        /// Description of the missing key.
        message: String,
    },

    /// A stored field or value has the wrong shape.
    #[error("type mismatch: {message}")]
    TypeMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// Creation options are malformed or unsupported.
    #[error("invalid options: {message}")]
    InvalidOptions {
        /// Description of the problem.
        message: String,
    },

    /// The operation was killed.
    #[error("operation was interrupted")]
    Interrupted,

    /// The operation ran past its deadline.
    #[error("operation exceeded time limit")]
    ExceededTimeLimit,

    /// Every operation is being killed for shutdown.
    #[error("interrupted at shutdown")]
    InterruptedAtShutdown,

    /// A lock could not be acquired before the timeout.
    #[error("lock timeout after {millis}ms")]
    LockTimeout {
        /// How long the caller waited.
        millis: u64,
    },

    /// The unit of work was aborted before it could commit.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for the abort.
        reason: String,
    },

    /// Another process holds the engine directory.
    #[error("engine directory locked: another process has exclusive access")]
    EngineLocked,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Maps an engine return code onto the core taxonomy.
    #[must_use]
    pub fn from_engine(err: EngineError) -> Self {
        match err {
            EngineError::Busy { uri } => Self::ResourceBusy { uri },
            EngineError::WriteConflict { uri } => Self::WriteConflict { uri },
            EngineError::DuplicateKey { uri } => Self::DuplicateKey {
                uri,
                key: String::new(),
            },
            EngineError::NotFound { what } => Self::NotFound { what },
            EngineError::AlreadyExists { uri } => Self::AlreadyExists { uri },
            EngineError::InvalidConfig(message) => Self::InvalidOptions { message },
            EngineError::Io(e) => Self::Io(e),
            other => Self::Engine(other),
        }
    }

    /// Creates a duplicate key error.
    pub fn duplicate_key(uri: impl Into<String>, key: impl Display) -> Self {
        Self::DuplicateKey {
            uri: uri.into(),
            key: key.to_string(),
        }
    }

    /// Creates a no such key error.
    pub fn no_such_key(message: impl Into<String>) -> Self {
        Self::NoSuchKey {
            message: message.into(),
        }
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Creates an invalid options error.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for [`CoreError::WriteConflict`].
    #[must_use]
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }

    /// Returns true for the cooperative interrupt conditions.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::ExceededTimeLimit | Self::InterruptedAtShutdown
        )
    }

    /// Returns true for [`CoreError::DuplicateKey`].
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    /// Returns true if the error means a resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        Self::from_engine(err)
    }
}

/// Logs an unrecoverable condition and panics.
///
/// The embedding process is expected to abort on panic.
#[track_caller]
pub fn fatal(message: impl Display) -> ! {
    tracing::error!(%message, "fatal assertion");
    panic!("fatal assertion: {message}");
}

/// Unwraps an engine result that must not fail.
#[track_caller]
pub fn invariant_ok<T>(result: EngineResult<T>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(format_args!("{context}: {err}")),
    }
}

/// Panics through [`fatal`] when `condition` does not hold.
#[track_caller]
pub fn invariant(condition: bool, message: &str) {
    if !condition {
        fatal(format_args!("invariant violated: {message}"));
    }
}
