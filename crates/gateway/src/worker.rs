//! Named background threads with a cooperative stop flag.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::telemetry;

/// Longest single sleep taken by [`pause`], bounding stop latency.
const PAUSE_SLICE: Duration = Duration::from_millis(25);

/// A long-running loop on its own thread. `stop` is idempotent and joins.
pub(crate) struct Worker {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    /// Spawn `body` on a thread named `name`; the loop must exit once the flag
    /// it receives reads `false`.
    pub(crate) fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let loop_flag = running.clone();
        let handle = telemetry::spawn_thread(name, move || body(loop_flag))?;
        Ok(Self {
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `duration`, waking early once `running` clears.
pub(crate) fn pause(running: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn stop_joins_and_is_idempotent() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();
        let worker = Worker::spawn("test-worker", move |running| {
            while running.load(Ordering::Relaxed) {
                counter.fetch_add(1, Ordering::Relaxed);
                pause(&running, Duration::from_millis(5));
            }
        })
        .unwrap();

        thread::sleep(Duration::from_millis(30));
        worker.stop();
        let after_stop = iterations.load(Ordering::Relaxed);
        assert!(after_stop > 0);
        worker.stop();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(iterations.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn pause_returns_early_when_stopped() {
        let running = AtomicBool::new(false);
        let started = Instant::now();
        pause(&running, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
