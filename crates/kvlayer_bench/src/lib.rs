//! Benchmark utilities.

#![warn(missing_docs)]

use kvlayer_core::{
    CollectionOptions, EngineConnection, EngineOptions, IndexDescriptor, IndexKey, OperationContext,
    ProcessContext, RecordStore, SortedIndex,
};
use rand::Rng;
use std::sync::Arc;

/// Generate random record data of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate `count` distinct single-field string keys in random order.
pub fn shuffled_keys(count: usize) -> Vec<IndexKey> {
    let mut rng = rand::thread_rng();
    let mut keys: Vec<IndexKey> = (0..count)
        .map(|i| IndexKey::single(format!("key-{i:08}")))
        .collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    keys
}

/// An in-memory engine with one record store and one index.
pub struct BenchEngine {
    /// Operation context for the benchmark thread.
    pub opctx: OperationContext,
    /// Record store `bench_records`.
    pub store: RecordStore,
    /// Index `bench_index` on field `a`.
    pub index: SortedIndex,
}

impl BenchEngine {
    /// Opens the engine and creates its resources.
    pub fn new(unique: bool) -> Self {
        let conn = EngineConnection::open_in_memory(EngineOptions::new())
            .expect("Failed to open in-memory engine");
        let options = CollectionOptions::default();
        conn.create_record_store("bench_records", &options)
            .expect("Failed to create record store");
        let mut descriptor = IndexDescriptor::new("bench_a", &["a"]);
        if unique {
            descriptor = descriptor.unique();
        }
        conn.create_sorted_data_interface("bench_index", &descriptor)
            .expect("Failed to create index");

        let store = conn.get_record_store("bench_records", &options);
        let index = conn.get_sorted_data_interface("bench_index", &descriptor);
        let process = ProcessContext::new(Arc::new(conn));
        Self {
            opctx: OperationContext::new(process, 1),
            store,
            index,
        }
    }
}
