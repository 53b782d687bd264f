//! Cooperative cancellation token threaded through every method that
//! performs I/O or sleeps, per the "Cancellation plumbing" design note:
//! nothing in this crate calls `thread::sleep` without going through
//! [`CancelToken::sleep`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    wake: Arc<(Mutex<()>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wake;
        let _guard = lock.lock().unwrap();
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `dur`, waking early if cancellation fires. Returns whether
    /// cancellation fired during the sleep.
    pub fn sleep(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let (lock, cvar) = &*self.wake;
        let guard = lock.lock().unwrap();
        let (_guard, _timeout) = cvar.wait_timeout(guard, dur).unwrap();
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn sleep_wakes_early_on_cancel() {
        let token = CancelToken::new();
        let t2 = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            t2.cancel();
        });
        let start = Instant::now();
        let cancelled = token.sleep(Duration::from_secs(10));
        assert!(cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn sleep_returns_false_without_cancel() {
        let token = CancelToken::new();
        let cancelled = token.sleep(Duration::from_millis(10));
        assert!(!cancelled);
    }
}
