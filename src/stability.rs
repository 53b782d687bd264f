//! StabilityDetector — waits until a candidate file's size and mtime stop
//! changing before admitting it to the queue (spec.md §4.7). Polling-based,
//! the same technique the Watcher itself uses to notice new files, so no
//! platform-specific "close write" event source is required.

use std::fs::Metadata;
use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Observation {
    size: u64,
    mtime: SystemTime,
}

fn observe(path: &Path) -> Result<Option<Observation>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(to_observation(&meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn to_observation(meta: &Metadata) -> Observation {
    Observation {
        size: meta.len(),
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

pub struct StabilityDetector {
    window: Duration,
    deadline: Duration,
}

impl StabilityDetector {
    pub fn new(window: Duration, deadline: Duration) -> Self {
        Self { window, deadline }
    }

    /// Block (in a cancel-aware, sleep-based loop) until `path`'s (size,
    /// mtime) match across two observations spaced `window` apart. Returns
    /// `Ok(())` once stable.
    ///
    /// - `Err(Error::Deadline(_))` if `deadline` elapses first.
    /// - `Err(Error::Cancelled)` if `cancel` fires.
    /// - `Err(Error::Io { .. })` (kind not-found wrapped as a distinguishable
    ///   message) if the file disappears mid-wait.
    pub fn wait_for_stability(&self, path: &Path, cancel: &CancelToken) -> Result<()> {
        let start = std::time::Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if start.elapsed() >= self.deadline {
                return Err(Error::Deadline(path.display().to_string()));
            }

            let Some(first) = observe(path)? else {
                return Err(Error::Format(format!(
                    "{} disappeared while waiting for stability",
                    path.display()
                )));
            };

            if cancel.sleep(self.window) {
                return Err(Error::Cancelled);
            }
            if start.elapsed() >= self.deadline {
                return Err(Error::Deadline(path.display().to_string()));
            }

            let Some(second) = observe(path)? else {
                return Err(Error::Format(format!(
                    "{} disappeared while waiting for stability",
                    path.display()
                )));
            };

            if first == second {
                return Ok(());
            }
            // Not yet stable: loop and take a fresh pair of observations.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stable_file_is_admitted_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"done growing").unwrap();

        let detector = StabilityDetector::new(Duration::from_millis(20), Duration::from_secs(5));
        detector.wait_for_stability(&path, &CancelToken::new()).unwrap();
    }

    #[test]
    fn growing_file_is_not_yet_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"a").unwrap();

        let detector = StabilityDetector::new(Duration::from_millis(30), Duration::from_millis(80));
        let cancel = CancelToken::new();
        let path2 = path.clone();
        let writer = std::thread::spawn(move || {
            for i in 0..10u8 {
                std::thread::sleep(Duration::from_millis(15));
                let mut f = std::fs::OpenOptions::new().append(true).open(&path2).unwrap();
                f.write_all(&[i]).unwrap();
            }
        });
        let err = detector.wait_for_stability(&path, &cancel).unwrap_err();
        assert!(matches!(err, Error::Deadline(_)));
        writer.join().unwrap();
    }

    #[test]
    fn deadline_exceeded_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.bin");
        let detector = StabilityDetector::new(Duration::from_millis(10), Duration::from_millis(1));
        // deadline so short it trips before the first pair completes
        let err = detector.wait_for_stability(&path, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)) || matches!(err, Error::Deadline(_)));
    }

    #[test]
    fn gone_file_is_a_distinguishable_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("will-vanish.bin");
        std::fs::write(&path, b"x").unwrap();
        std::fs::remove_file(&path).unwrap();

        let detector = StabilityDetector::new(Duration::from_millis(20), Duration::from_secs(5));
        let err = detector.wait_for_stability(&path, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn cancellation_aborts_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"x").unwrap();

        let detector = StabilityDetector::new(Duration::from_secs(10), Duration::from_secs(60));
        let cancel = CancelToken::new();
        let cancel2 = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            cancel2.cancel();
        });
        let err = detector.wait_for_stability(&path, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
