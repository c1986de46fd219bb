//! Background retry of deferred drops.

use crate::process::ProcessContext;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Wakeable stop flag shared with the worker thread.
#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        let _guard = self.mutex.lock();
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`. Returns true if stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.mutex.lock();
        if self.is_stopped() {
            return true;
        }
        self.condvar.wait_for(&mut guard, timeout);
        self.is_stopped()
    }
}

/// Periodically retries drops the connection had to defer.
///
/// The thread exits when [`stop`](Self::stop) is called, when the worker is
/// dropped, when every operation is killed, or when the connection shuts
/// down.
pub struct MaintenanceWorker {
    signal: Arc<StopSignal>,
    passes: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Starts the worker.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the thread cannot be spawned.
    pub fn start(process: Arc<ProcessContext>, interval: Duration) -> std::io::Result<Self> {
        let signal = Arc::new(StopSignal::default());
        let passes = Arc::new(AtomicU64::new(0));
        let thread_signal = Arc::clone(&signal);
        let thread_passes = Arc::clone(&passes);

        let handle = std::thread::Builder::new()
            .name("kvlayer-maintenance".into())
            .spawn(move || {
                tracing::debug!(
                    interval_ms = interval.as_millis() as u64,
                    "maintenance worker started"
                );
                loop {
                    if process.registry().kill_all_pending()
                        || process.connection().is_shut_down()
                    {
                        break;
                    }
                    let conn = process.connection();
                    if conn.have_drops_queued() {
                        match conn.retry_queued_drops() {
                            Ok(dropped) if dropped > 0 => {
                                tracing::debug!(dropped, "maintenance dropped queued idents");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "retrying queued drops failed"),
                        }
                    }
                    thread_passes.fetch_add(1, Ordering::SeqCst);
                    if thread_signal.wait(interval) {
                        break;
                    }
                }
                tracing::debug!("maintenance worker stopped");
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn maintenance thread");
                e
            })?;

        Ok(Self {
            signal,
            passes,
            handle: Some(handle),
        })
    }

    /// Number of completed passes.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Returns true while the thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MaintenanceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceWorker")
            .field("running", &self.is_running())
            .field("passes", &self.passes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionOptions, EngineOptions};
    use crate::connection::EngineConnection;
    use std::time::Instant;

    fn process() -> Arc<ProcessContext> {
        let conn = EngineConnection::open_in_memory(EngineOptions::new()).unwrap();
        ProcessContext::new(Arc::new(conn))
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn retries_deferred_drop() {
        let process = process();
        let conn = Arc::clone(process.connection());
        conn.create_record_store("r1", &CollectionOptions::default()).unwrap();

        let mut session = conn.session_pool().standalone_session().unwrap();
        let cursor = session.open_cursor("table:r1").unwrap();
        conn.drop_record_store("r1").unwrap();
        assert_eq!(conn.pending_drops(), vec!["table:r1".to_string()]);

        let mut worker =
            MaintenanceWorker::start(Arc::clone(&process), Duration::from_millis(10)).unwrap();
        assert!(wait_until(|| worker.passes() >= 2));
        assert!(!conn.pending_drops().is_empty());

        drop(cursor);
        assert!(wait_until(|| conn.pending_drops().is_empty()));
        assert!(!conn.has_ident("r1").unwrap());
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn exits_on_kill_all() {
        let process = process();
        let worker =
            MaintenanceWorker::start(Arc::clone(&process), Duration::from_millis(5)).unwrap();
        process.registry().kill_all_operations();
        assert!(wait_until(|| !worker.is_running()));
    }

    #[test]
    fn stop_wakes_long_interval() {
        let mut worker = MaintenanceWorker::start(process(), Duration::from_secs(3600)).unwrap();
        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
