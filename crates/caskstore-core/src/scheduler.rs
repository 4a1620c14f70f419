//! Background compaction scheduler
//!
//! A named thread wakes up every `interval`, runs one policy check through
//! the supplied cycle closure, and goes back to sleep. The sleep is split
//! into short steps so a shutdown request is noticed quickly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{CaskError, CaskResult};

/// Longest single sleep between shutdown checks
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// What a cycle asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    /// Keep running
    Continue,
    /// The store is gone; exit the thread
    Stop,
}

/// Handle to the running compactor thread.
/// Dropping the handle stops the thread and waits for it.
pub struct CompactorHandle {
    shutdown: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Request shutdown and wait for the thread to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Number of completed policy checks.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn the scheduler thread, calling `cycle` once per `interval`.
pub fn spawn_compactor<F>(
    name: &str,
    interval: Duration,
    mut cycle: F,
) -> CaskResult<CompactorHandle>
where
    F: FnMut() -> Cycle + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let cycles = Arc::new(AtomicU64::new(0));
    let thread_shutdown = Arc::clone(&shutdown);
    let thread_cycles = Arc::clone(&cycles);

    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "compactor started");
            while sleep_unless_shutdown(interval, &thread_shutdown) {
                let next = cycle();
                thread_cycles.fetch_add(1, Ordering::Relaxed);
                if next == Cycle::Stop {
                    break;
                }
            }
            debug!("compactor stopped");
        })
        .map_err(|e| CaskError::Io {
            path: None,
            kind: e.kind(),
            message: format!("failed to spawn compactor thread: {}", e),
        })?;

    Ok(CompactorHandle {
        shutdown,
        cycles,
        thread: Some(thread),
    })
}

/// Sleep for `interval`. Returns false if shutdown was requested.
fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) -> bool {
    let wake = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= wake {
            return true;
        }
        thread::sleep((wake - now).min(SHUTDOWN_POLL));
    }
}
