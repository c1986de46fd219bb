//! Approximate per-resource record counts and data sizes.
//!
//! The in-memory map is the working copy. It is persisted to a dedicated
//! engine table keyed by resource name, with CBOR-encoded [`SizeInfo`]
//! values, on a time/operation-count interval and at shutdown. Values may lag
//! the true contents of a record store and are only used for reporting.

use crate::error::{CoreError, CoreResult};
use kvlayer_storage::KvSession;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Create string of the persisted statistics table.
pub const SIZE_STORER_CONFIG: &str = "type=file,key_format=S,value_format=u";

/// Record count and data size of one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    /// Number of records.
    pub num_records: u64,
    /// Total size of the records in bytes.
    pub data_size: u64,
}

impl SizeInfo {
    fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::type_mismatch(format!("size info encoding: {e}")))?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| CoreError::type_mismatch(format!("size info decoding: {e}")))
    }
}

/// In-memory statistics map with explicit persistence.
#[derive(Debug, Default)]
pub struct SizeStorer {
    entries: Mutex<HashMap<String, SizeInfo>>,
}

impl SizeStorer {
    /// Creates an empty storer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the in-memory map with the contents of the table at `uri`,
    /// creating the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` if a persisted entry cannot be decoded.
    pub fn load_from(&self, session: &mut dyn KvSession, uri: &str) -> CoreResult<()> {
        if !session.table_exists(uri)? {
            session.create(uri, SIZE_STORER_CONFIG)?;
            tracing::debug!(uri, "created size storer table");
        }

        let mut loaded = HashMap::new();
        let mut cursor = session.open_cursor(uri)?;
        while cursor.next()? {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            let ident = String::from_utf8(key.to_vec())
                .map_err(|_| CoreError::type_mismatch("size storer key is not UTF-8"))?;
            loaded.insert(ident, SizeInfo::decode(value)?);
        }
        drop(cursor);

        tracing::debug!(uri, entries = loaded.len(), "loaded size storer");
        *self.entries.lock() = loaded;
        Ok(())
    }

    /// Records the current counts of a resource. Not persisted until the
    /// next [`store_into`](Self::store_into).
    pub fn store(&self, uri: &str, num_records: u64, data_size: u64) {
        self.entries.lock().insert(
            uri.to_string(),
            SizeInfo {
                num_records,
                data_size,
            },
        );
    }

    /// Returns the stored counts of a resource, if any.
    #[must_use]
    pub fn get(&self, uri: &str) -> Option<SizeInfo> {
        self.entries.lock().get(uri).copied()
    }

    /// Returns the stored counts of a resource, zero if absent.
    #[must_use]
    pub fn load(&self, uri: &str) -> SizeInfo {
        self.get(uri).unwrap_or_default()
    }

    /// Forgets a resource.
    pub fn remove(&self, uri: &str) {
        self.entries.lock().remove(uri);
    }

    /// Returns the number of tracked resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no resource is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the table at `uri` with the in-memory map.
    ///
    /// Runs in whatever transaction `session` has open; the caller owns the
    /// transaction boundary.
    ///
    /// # Errors
    ///
    /// Returns `WriteConflict` (at commit) if another flush raced this one.
    pub fn store_into(&self, session: &mut dyn KvSession, uri: &str) -> CoreResult<usize> {
        let snapshot = self.entries.lock().clone();
        let mut cursor = session.open_cursor(uri)?;

        let mut stale = Vec::new();
        while cursor.next()? {
            if let Some(key) = cursor.key() {
                let known = std::str::from_utf8(key).is_ok_and(|k| snapshot.contains_key(k));
                if !known {
                    stale.push(key.to_vec());
                }
            }
        }
        for key in stale {
            cursor.remove(&key)?;
        }

        for (ident, info) in &snapshot {
            cursor.insert(ident.as_bytes(), &info.encode()?, true)?;
        }
        Ok(snapshot.len())
    }
}

/// Signals when a time or operation-count interval has passed.
#[derive(Debug)]
pub struct ElapsedTracker {
    hit_limit: u64,
    interval: Duration,
    state: Mutex<TrackerState>,
}

#[derive(Debug)]
struct TrackerState {
    pings: u64,
    last: Instant,
}

impl ElapsedTracker {
    /// Creates a tracker that fires every `hit_limit` pings or every `interval`.
    #[must_use]
    pub fn new(hit_limit: u64, interval: Duration) -> Self {
        Self {
            hit_limit,
            interval,
            state: Mutex::new(TrackerState {
                pings: 0,
                last: Instant::now(),
            }),
        }
    }

    /// Counts one ping and returns true if either limit was reached.
    ///
    /// Firing restarts both limits.
    pub fn interval_has_elapsed(&self) -> bool {
        let mut state = self.state.lock();
        state.pings += 1;
        if state.pings >= self.hit_limit || state.last.elapsed() >= self.interval {
            state.pings = 0;
            state.last = Instant::now();
            return true;
        }
        false
    }

    /// Restarts both limits.
    pub fn reset_last_time(&self) {
        let mut state = self.state.lock();
        state.pings = 0;
        state.last = Instant::now();
    }
}
