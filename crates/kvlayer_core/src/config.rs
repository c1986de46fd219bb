//! Engine, collection and index configuration.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

/// Share of physical memory given to the engine cache.
const DEFAULT_CACHE_PERCENT: u64 = 10;

/// Configuration for opening an [`EngineConnection`](crate::EngineConnection).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Cache size in GiB. `None` sizes the cache from physical memory.
    pub cache_size_gb: Option<u64>,

    /// Maximum number of engine sessions.
    pub session_max: usize,

    /// Whether the engine keeps a durability journal.
    pub durable: bool,

    /// Seconds between automatic engine checkpoints.
    pub checkpoint_wait_secs: u64,

    /// Journal volume that triggers an engine checkpoint.
    pub checkpoint_log_size: String,

    /// Engine extensions to load.
    pub extensions: Vec<String>,

    /// Appended verbatim to the engine open string.
    pub extra_open_options: String,

    /// Appended to every record store create string.
    pub record_store_extra_options: String,

    /// Appended to every index create string.
    pub index_extra_options: String,

    /// Size changes between opportunistic size storer syncs.
    pub size_storer_sync_ops: u64,

    /// Time between opportunistic size storer syncs.
    pub size_storer_sync_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            cache_size_gb: None,
            session_max: 20_000,
            durable: true,
            checkpoint_wait_secs: 60,
            checkpoint_log_size: "2GB".to_string(),
            extensions: vec!["local=(entry=index_collator_extension)".to_string()],
            extra_open_options: String::new(),
            record_store_extra_options: String::new(),
            index_extra_options: String::new(),
            size_storer_sync_ops: 100_000,
            size_storer_sync_interval: Duration::from_secs(60),
        }
    }
}

impl EngineOptions {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache size in GiB.
    #[must_use]
    pub const fn cache_size_gb(mut self, gb: u64) -> Self {
        self.cache_size_gb = Some(gb);
        self
    }

    /// Sets the maximum number of sessions.
    #[must_use]
    pub const fn session_max(mut self, max: usize) -> Self {
        self.session_max = max;
        self
    }

    /// Sets whether the engine keeps a journal.
    #[must_use]
    pub const fn durable(mut self, value: bool) -> Self {
        self.durable = value;
        self
    }

    /// Sets the checkpoint interval in seconds.
    #[must_use]
    pub const fn checkpoint_wait_secs(mut self, secs: u64) -> Self {
        self.checkpoint_wait_secs = secs;
        self
    }

    /// Sets the extra engine open options.
    #[must_use]
    pub fn extra_open_options(mut self, options: impl Into<String>) -> Self {
        self.extra_open_options = options.into();
        self
    }

    /// Sets the extra record store create options.
    #[must_use]
    pub fn record_store_extra_options(mut self, options: impl Into<String>) -> Self {
        self.record_store_extra_options = options.into();
        self
    }

    /// Sets the extra index create options.
    #[must_use]
    pub fn index_extra_options(mut self, options: impl Into<String>) -> Self {
        self.index_extra_options = options.into();
        self
    }

    /// Sets the size storer sync thresholds.
    #[must_use]
    pub const fn size_storer_sync(mut self, ops: u64, interval: Duration) -> Self {
        self.size_storer_sync_ops = ops;
        self.size_storer_sync_interval = interval;
        self
    }

    /// Returns the configured cache size, or the physical-memory heuristic.
    #[must_use]
    pub fn effective_cache_size_gb(&self) -> u64 {
        self.cache_size_gb
            .unwrap_or_else(|| default_cache_size_gb(physical_memory_bytes()))
    }

    /// Renders the engine open string.
    ///
    /// ```rust
    /// use kvlayer_core::EngineOptions;
    ///
    /// let config = EngineOptions::new().durable(false).open_config_string(4);
    /// assert!(config.starts_with("create,cache_size=4G,session_max=20000,"));
    /// assert!(!config.contains("log="));
    /// ```
    #[must_use]
    pub fn open_config_string(&self, cache_gb: u64) -> String {
        let mut config = String::new();
        config.push_str("create,");
        let _ = write!(config, "cache_size={cache_gb}G,");
        let _ = write!(config, "session_max={},", self.session_max);
        let _ = write!(config, "extensions=[{}],", self.extensions.join(","));
        config.push_str("statistics=(all),");
        if self.durable {
            config.push_str("log=(enabled=true,archive=true,path=journal),");
        }
        let _ = write!(
            config,
            "checkpoint=(wait={},log_size={}),",
            self.checkpoint_wait_secs, self.checkpoint_log_size
        );
        config.push_str(&self.extra_open_options);
        config
    }
}

/// Cache size for a machine with `physical_bytes` of memory.
///
/// One tenth of physical memory, never less than 1 GiB.
#[must_use]
pub fn default_cache_size_gb(physical_bytes: Option<u64>) -> u64 {
    physical_bytes
        .map(|total| total / DEFAULT_CACHE_PERCENT / GIB)
        .unwrap_or(1)
        .max(1)
}

fn physical_memory_bytes() -> Option<u64> {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    match sys.total_memory() {
        0 => None,
        total => Some(total),
    }
}

/// Options a record store is created with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Whether the store is capped.
    pub capped: bool,

    /// Byte cap. Zero means the default of 4096.
    pub capped_size: u64,

    /// Record cap. Zero means unlimited.
    pub capped_max_docs: u64,

    /// Per-store engine options appended to the create string.
    pub storage_engine: String,
}

impl CollectionOptions {
    /// Default byte cap of a capped store.
    pub const DEFAULT_CAPPED_SIZE: u64 = 4096;

    /// Options for a capped store.
    #[must_use]
    pub fn capped(size: u64, max_docs: u64) -> Self {
        Self {
            capped: true,
            capped_size: size,
            capped_max_docs: max_docs,
            ..Self::default()
        }
    }

    /// Returns the byte cap, applying the default.
    #[must_use]
    pub fn effective_capped_size(&self) -> u64 {
        if self.capped_size == 0 {
            Self::DEFAULT_CAPPED_SIZE
        } else {
            self.capped_size
        }
    }

    /// Returns the record cap, or `None` if unlimited.
    #[must_use]
    pub fn effective_capped_max_docs(&self) -> Option<u64> {
        (self.capped_max_docs > 0).then_some(self.capped_max_docs)
    }
}

/// Description of a sorted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name.
    pub name: String,

    /// Names of the indexed fields, in key order.
    pub key_pattern: Vec<String>,

    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDescriptor {
    /// Creates a descriptor for a standard index.
    pub fn new(name: impl Into<String>, key_pattern: &[&str]) -> Self {
        Self {
            name: name.into(),
            key_pattern: key_pattern.iter().map(|f| (*f).to_string()).collect(),
            unique: false,
        }
    }

    /// Makes this a unique index.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Number of fields in each key.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.key_pattern.len()
    }

    /// Checks that the descriptor can be written into an engine config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOptions` for an empty key pattern or names containing
    /// characters outside `[A-Za-z0-9_.-$]`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.key_pattern.is_empty() {
            return Err(CoreError::invalid_options(format!(
                "index '{}' has an empty key pattern",
                self.name
            )));
        }
        for name in std::iter::once(&self.name).chain(&self.key_pattern) {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '$'));
            if !valid {
                return Err(CoreError::invalid_options(format!(
                    "invalid name '{name}' in index '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = EngineOptions::default();
        assert_eq!(options.session_max, 20_000);
        assert!(options.durable);
        assert_eq!(options.checkpoint_wait_secs, 60);
        assert_eq!(options.size_storer_sync_ops, 100_000);
    }

    #[test]
    fn builder_pattern() {
        let options = EngineOptions::new()
            .cache_size_gb(3)
            .durable(false)
            .session_max(8)
            .extra_open_options("eviction=(threads_max=2)");

        assert_eq!(options.effective_cache_size_gb(), 3);
        assert!(!options.durable);
        assert_eq!(options.session_max, 8);
    }

    #[test]
    fn durable_config_string() {
        let config = EngineOptions::new()
            .extra_open_options("eviction=(threads_max=2)")
            .open_config_string(2);
        assert_eq!(
            config,
            "create,cache_size=2G,session_max=20000,\
             extensions=[local=(entry=index_collator_extension)],statistics=(all),\
             log=(enabled=true,archive=true,path=journal),\
             checkpoint=(wait=60,log_size=2GB),eviction=(threads_max=2)"
        );
        assert!(kvlayer_storage::EngineConfig::parse(&config).is_ok());
    }

    #[test]
    fn cache_heuristic() {
        assert_eq!(default_cache_size_gb(None), 1);
        assert_eq!(default_cache_size_gb(Some(4 * GIB)), 1);
        assert_eq!(default_cache_size_gb(Some(64 * GIB)), 6);
        assert!(EngineOptions::new().effective_cache_size_gb() >= 1);
    }

    #[test]
    fn capped_defaults() {
        let options = CollectionOptions::capped(0, 0);
        assert_eq!(options.effective_capped_size(), 4096);
        assert_eq!(options.effective_capped_max_docs(), None);
        assert_eq!(CollectionOptions::capped(100, 5).effective_capped_max_docs(), Some(5));
    }

    #[test]
    fn descriptor_validation() {
        assert!(IndexDescriptor::new("a_1", &["a"]).validate().is_ok());
        assert!(IndexDescriptor::new("bad,name", &["a"]).validate().is_err());
        assert!(IndexDescriptor::new("empty", &[]).validate().is_err());
    }

    #[test]
    fn options_serialize() {
        let desc = IndexDescriptor::new("idx1", &["a", "b"]).unique();
        let json = serde_json::to_string(&desc).unwrap();
        let back: IndexDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }
}
