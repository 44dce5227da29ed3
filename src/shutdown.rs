//! Process-wide shutdown signal.
//!
//! One `Shutdown` handle is shared by every long-lived thread. Loops check
//! `is_running()` at each iteration head and use `sleep()` instead of
//! `thread::sleep` so a signal wakes blocked threads promptly instead of
//! waiting out the full interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(true),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every thread sleeping via this handle.
    pub fn trigger(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cond.notify_all();
    }

    /// Sleep for `dur` or until shutdown is triggered, whichever is first.
    /// Returns false if shutdown was triggered.
    pub fn sleep(&self, dur: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        let guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (_guard, _timeout) = self
            .inner
            .cond
            .wait_timeout(guard, dur)
            .unwrap_or_else(|e| e.into_inner());
        self.is_running()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_returns_early_on_trigger() {
        let shutdown = Shutdown::new();
        let waker = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.trigger();
        });

        let start = Instant::now();
        let still_running = shutdown.sleep(Duration::from_secs(10));
        handle.join().unwrap();

        assert!(!still_running);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_runs_out_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(shutdown.sleep(Duration::from_millis(10)));
        assert!(shutdown.is_running());
    }
}
