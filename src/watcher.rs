//! Watcher — polling directory event source (spec.md §4.10). Scans its
//! watched root once at startup (so pre-existing files aren't lost across a
//! restart), then re-scans on a fixed interval; newly admitted paths run
//! through [`StabilityDetector`] before becoming a [`QueueItem`].
//!
//! No native inotify/kqueue dependency: the corpus this crate is grown from
//! has none, and the StabilityDetector is itself poll-based, so the watcher
//! reuses the same poll-a-directory-snapshot technique.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::consts::{CHECKSUM_EXT, ENC_EXT, KEY_EXT, KEY_SIDECAR_POLL, KEY_SIDECAR_WAIT};
use crate::envelope::{decrypt_side_checksum_sidecar, decrypt_side_key_sidecar, encrypt_side_key_sidecar};
use crate::error::Result;
use crate::queue::{Operation, PersistentQueue, QueueItem};
use crate::stability::StabilityDetector;

/// Which side of the pipeline a watched root feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Encrypt,
    Decrypt,
}

pub struct Watcher {
    root: PathBuf,
    dest_root: PathBuf,
    mode: Mode,
    poll_interval: Duration,
    detector: StabilityDetector,
    seen: std::sync::Mutex<HashSet<PathBuf>>,
}

impl Watcher {
    pub fn new(
        root: PathBuf,
        dest_root: PathBuf,
        mode: Mode,
        poll_interval: Duration,
        detector: StabilityDetector,
    ) -> Self {
        Self {
            root,
            dest_root,
            mode,
            poll_interval,
            detector,
            seen: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Scan the root once, admitting every eligible path not yet seen, and
    /// feed it to `queue` after it stabilizes. Intended to be called first
    /// at startup (covers files dropped before the service last ran) and
    /// then repeatedly on `poll_interval`.
    pub fn scan_once(&self, queue: &PersistentQueue, cancel: &CancelToken) -> Result<()> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(crate::error::Error::io(&self.root, e)),
        };
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(crate::error::Error::Cancelled);
            }
            let entry = entry.map_err(|e| crate::error::Error::io(&self.root, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| crate::error::Error::io(&path, e))?;
            if file_type.is_dir() {
                continue;
            }
            {
                let mut seen = self.seen.lock().unwrap();
                if seen.contains(&path) {
                    continue;
                }
                seen.insert(path.clone());
            }
            if !self.admit(&path, cancel)? {
                continue;
            }
            if let Err(e) = self.detector.wait_for_stability(&path, cancel) {
                log::warn!("watcher: {} did not stabilize: {e}", path.display());
                continue;
            }
            log::info!("watcher: admitting stabilized path {}", path.display());
            let item = self.to_queue_item(&path)?;
            queue.enqueue(item)?;
        }
        Ok(())
    }

    /// Run the scan loop until `cancel` fires, sleeping `poll_interval`
    /// between re-scans. The very first iteration runs immediately so
    /// pre-existing files are picked up without waiting a full interval.
    pub fn run(&self, queue: &PersistentQueue, cancel: &CancelToken) -> Result<()> {
        loop {
            self.scan_once(queue, cancel)?;
            if cancel.sleep(self.poll_interval) {
                return Ok(());
            }
        }
    }

    fn admit(&self, path: &Path, cancel: &CancelToken) -> Result<bool> {
        let ext = path.extension().and_then(|e| e.to_str());
        match self.mode {
            Mode::Encrypt => Ok(!matches!(ext, Some(ENC_EXT) | Some(KEY_EXT) | Some(CHECKSUM_EXT))),
            Mode::Decrypt => {
                if ext != Some(ENC_EXT) {
                    return Ok(false);
                }
                Ok(self.wait_for_key_sidecar(path, cancel))
            }
        }
    }

    /// The payload can land slightly before its `.key` sidecar; poll for up
    /// to [`KEY_SIDECAR_WAIT`] before giving up on this scan pass (it will
    /// be retried on the next poll since the path stays unseen until
    /// admitted).
    fn wait_for_key_sidecar(&self, enc_path: &Path, cancel: &CancelToken) -> bool {
        let key_path = decrypt_side_key_sidecar(enc_path);
        let deadline = std::time::Instant::now() + KEY_SIDECAR_WAIT;
        loop {
            if key_path.exists() {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                self.seen.lock().unwrap().remove(enc_path);
                return false;
            }
            if cancel.sleep(KEY_SIDECAR_POLL) {
                return false;
            }
        }
    }

    fn to_queue_item(&self, path: &Path) -> Result<QueueItem> {
        let size = std::fs::metadata(path).map_err(|e| crate::error::Error::io(path, e))?.len();
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.mode {
            Mode::Encrypt => {
                let dest = self.dest_root.join(format!("{basename}.{ENC_EXT}"));
                let key_path = encrypt_side_key_sidecar(path, &dest);
                Ok(QueueItem::new(
                    path.display().to_string(),
                    Operation::Encrypt,
                    path.to_path_buf(),
                    dest,
                    key_path,
                    None,
                    size,
                ))
            }
            Mode::Decrypt => {
                let without_ext = basename.strip_suffix(&format!(".{ENC_EXT}")).unwrap_or(&basename);
                let dest = self.dest_root.join(without_ext);
                let key_path = decrypt_side_key_sidecar(path);
                let checksum_path = decrypt_side_checksum_sidecar(path);
                Ok(QueueItem::new(
                    path.display().to_string(),
                    Operation::Decrypt,
                    path.to_path_buf(),
                    dest,
                    key_path,
                    Some(checksum_path),
                    size,
                ))
            }
        }
    }
}
