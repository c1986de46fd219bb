//! # kvlayer Testkit
//!
//! Test utilities for kvlayer.
//!
//! This crate provides:
//! - Engine fixtures backed by memory or a temporary directory
//! - Property-based test generators using proptest
//! - Concurrent stress runners
//! - A tracing subscriber wired to the test harness output
//!
//! ## Usage
//!
//! ```rust
//! use kvlayer_testkit::prelude::*;
//!
//! let engine = TestEngine::memory();
//! let store = engine.record_store("r1");
//! let mut opctx = engine.opctx();
//! assert_eq!(store.num_records(&mut opctx).unwrap(), 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Calling this
/// more than once is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
