//! Stress runners for kvlayer.
//!
//! These helpers drive concurrent units of work against one engine and
//! retry on write conflicts the way callers of the layer are expected to.

use crate::fixtures::TestEngine;
use kvlayer_core::{CoreResult, IndexKey, OperationContext, RecordId, WriteUnitOfWork};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Units of work that committed.
    pub committed: usize,
    /// Attempts that ended in a write conflict and were retried.
    pub conflicts: usize,
    /// Total duration.
    pub duration: Duration,
    /// Committed units of work per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(committed: usize, conflicts: usize, duration: Duration) -> Self {
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            committed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };
        Self {
            committed,
            conflicts,
            duration,
            ops_per_second,
        }
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Units of work each thread commits.
    pub ops_per_thread: usize,
    /// Attempts per unit of work before giving up.
    pub max_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 50,
            max_attempts: 1_000,
        }
    }
}

/// Runs `op` inside a unit of work, retrying it on write conflicts.
///
/// Returns the value and the number of conflicts seen.
///
/// # Errors
///
/// Returns the first error that is not a write conflict, or the last
/// conflict once `max_attempts` is reached.
pub fn with_write_conflict_retry<T>(
    opctx: &mut OperationContext,
    max_attempts: usize,
    mut op: impl FnMut(&mut OperationContext) -> CoreResult<T>,
) -> CoreResult<(T, usize)> {
    let mut conflicts = 0;
    loop {
        let attempt = WriteUnitOfWork::new(opctx).and_then(|mut wuow| {
            let value = op(&mut *wuow)?;
            wuow.commit()?;
            Ok(value)
        });
        match attempt {
            Err(err) if err.is_write_conflict() && conflicts + 1 < max_attempts => {
                conflicts += 1;
                tracing::trace!(conflicts, "write conflict, retrying");
                thread::yield_now();
            }
            Err(err) => return Err(err),
            Ok(value) => return Ok((value, conflicts)),
        }
    }
}

fn run_workers<F>(engine: &TestEngine, config: &StressConfig, work: F) -> StressTestResult
where
    F: Fn(&mut OperationContext, usize, usize) -> CoreResult<()> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let committed = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let process = Arc::clone(&engine.process);
            let work = Arc::clone(&work);
            let committed = Arc::clone(&committed);
            let conflicts = Arc::clone(&conflicts);
            let config = config.clone();
            thread::spawn(move || {
                let mut opctx = OperationContext::new(process, 1_000 + t as u64);
                for i in 0..config.ops_per_thread {
                    let attempt = |opctx: &mut OperationContext| work(opctx, t, i);
                    let (_, seen) =
                        with_write_conflict_retry(&mut opctx, config.max_attempts, attempt)
                            .expect("Stress unit of work failed");
                    committed.fetch_add(1, Ordering::Relaxed);
                    conflicts.fetch_add(seen, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress worker panicked");
    }

    StressTestResult::new(
        committed.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Inserts disjoint records and unique index entries from every thread.
pub fn stress_disjoint_inserts(engine: &TestEngine, config: &StressConfig) -> StressTestResult {
    let store = engine.record_store("stress_records");
    let index = engine.index("stress_index", true);
    run_workers(engine, config, move |opctx, t, i| {
        let id = store.insert_record(opctx, format!("{t}:{i}").as_bytes())?;
        index.insert(opctx, &IndexKey::single(format!("k{t:03}-{i:06}")), id, false)
    })
}

/// Has every thread rewrite the same record, forcing write conflicts.
///
/// Returns the id of the contended record along with the result.
pub fn stress_hot_record(
    engine: &TestEngine,
    config: &StressConfig,
) -> (StressTestResult, RecordId) {
    let store = engine.record_store("stress_hot");
    let hot = {
        let mut opctx = engine.opctx();
        let (id, _) =
            with_write_conflict_retry(&mut opctx, 1, |opctx| store.insert_record(opctx, b"0"))
                .expect("Failed to seed hot record");
        id
    };
    let result = run_workers(engine, config, move |opctx, t, i| {
        store.update_record(opctx, hot, format!("{t}:{i}").as_bytes())
    });
    (result, hot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_inserts_all_commit() {
        let engine = TestEngine::memory();
        let config = StressConfig {
            threads: 3,
            ops_per_thread: 20,
            ..StressConfig::default()
        };
        let result = stress_disjoint_inserts(&engine, &config);
        assert_eq!(result.committed, 60);

        let mut opctx = engine.opctx();
        let store = engine.record_store("stress_records");
        assert_eq!(store.num_records(&mut opctx).unwrap(), 60);
        let index = engine.index("stress_index", true);
        assert_eq!(index.full_validate(&mut opctx).unwrap(), 60);
    }

    #[test]
    fn hot_record_survives_conflicts() {
        let engine = TestEngine::memory();
        let config = StressConfig {
            threads: 4,
            ops_per_thread: 10,
            ..StressConfig::default()
        };
        let (result, hot) = stress_hot_record(&engine, &config);
        assert_eq!(result.committed, 40);

        let mut opctx = engine.opctx();
        let store = engine.record_store("stress_hot");
        assert_eq!(store.num_records(&mut opctx).unwrap(), 1);
        assert!(store.find_record(&mut opctx, hot).unwrap().is_some());
    }
}
