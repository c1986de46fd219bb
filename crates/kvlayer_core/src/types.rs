//! Core type definitions for kvlayer.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Location of a record inside a record store.
///
/// Record ids are allocated monotonically per store. `0` and `u64::MAX`
/// are reserved as the [`min`](RecordId::min) and [`max`](RecordId::max)
/// sentinels used when positioning index cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Size of the big-endian key encoding.
    pub const ENCODED_LEN: usize = 8;

    /// Creates a new record id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The smallest possible id. Sorts before every real record.
    #[must_use]
    pub const fn min() -> Self {
        Self(0)
    }

    /// The largest possible id. Sorts after every real record.
    #[must_use]
    pub const fn max() -> Self {
        Self(u64::MAX)
    }

    /// Returns true if this is a real record location, not a sentinel.
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.0 != 0 && self.0 != u64::MAX
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next id.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Encodes the id as an order-preserving engine key.
    #[must_use]
    pub const fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes an id from an engine key.
    #[must_use]
    pub fn from_key(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(arr)))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rid:{}", self.0)
    }
}

/// Process-unique identifier of an operation.
///
/// Operation ids are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    /// Creates a new operation id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}", self.0)
    }
}
