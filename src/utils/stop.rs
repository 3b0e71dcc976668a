use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Cooperative stop flag shared between a worker thread and its owner.
///
/// Cancellation is one-way: once cancelled, a signal stays cancelled for the
/// rest of its life. Worker loops poll `cancelled()` at their wakeup points
/// and use `wait_timeout()` for interruptible backoff sleeps.
#[derive(Debug)]
pub struct StopSignal {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);

        // Lock briefly so the store cannot race a waiter between its check
        // and its wait.
        let _guard = self.shared.mutex.lock().unwrap();
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    /// Block until cancelled.
    pub fn wait_cancellation(&self) {
        let mut guard = self.shared.mutex.lock().unwrap();

        while !self.cancelled() {
            guard = self.shared.condvar.wait(guard).unwrap();
        }
    }

    /// Sleep for at most `timeout`, waking early on cancellation.
    ///
    /// Returns `true` when the signal was cancelled, `false` when the full
    /// timeout elapsed. Used by reconnect backoff so a disable request does
    /// not have to wait out the backoff window.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.shared.mutex.lock().unwrap();

        while !self.cancelled() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (g, _) = self
                .shared
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
        true
    }
}

impl Clone for StopSignal {
    fn clone(&self) -> StopSignal {
        StopSignal {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_timeout_returns_early_on_cancel() {
        let signal = StopSignal::new();
        let clone = signal.clone();

        let handle = thread::spawn(move || {
            let start = std::time::Instant::now();
            let cancelled = clone.wait_timeout(Duration::from_secs(5));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(30));
        signal.cancel();

        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(1));
    }

    #[test]
    fn wait_timeout_elapses_without_cancel() {
        let signal = StopSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.cancelled());
    }
}
