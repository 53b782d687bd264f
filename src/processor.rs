//! Processor — the single consumer thread that drains the
//! [`PersistentQueue`], dispatches to [`crate::envelope`], and applies
//! post-processing disposition on success or failure (spec.md §4.9).
//!
//! Error classification follows spec.md §7's propagation policy exactly:
//! `Cancelled`/`Deadline` pause the tick without touching the queue at all
//! (the file may simply not be ready yet); `Kms`/`Io`/`Integrity` drive
//! requeue-with-backoff, leaving the source in place until the item's final
//! disposition so a retry always finds the file where it left it;
//! `Format`/`Bounds` short-circuit straight to the failed directory, still
//! counting against the retry cap so a permanently malformed file
//! eventually dead-letters instead of looping forever.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::cancel::CancelToken;
use crate::config::{Disposition, VaultCryptConfig};
use crate::crypto::{FileCodec, KmsProvider};
use crate::envelope;
use crate::error::{Error, Result};
use crate::queue::{Operation, PersistentQueue, QueueItem, RequeueOutcome};
use crate::util::{best_effort_remove, move_into};

/// One finished unit of work, reported for logging/testing visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Requeued,
    DeadLettered,
}

pub struct Processor<'a> {
    kms: &'a dyn KmsProvider,
    queue: &'a PersistentQueue,
    config: &'a RwLock<VaultCryptConfig>,
    keep_running: &'a AtomicBool,
}

impl<'a> Processor<'a> {
    pub fn new(
        kms: &'a dyn KmsProvider,
        queue: &'a PersistentQueue,
        config: &'a RwLock<VaultCryptConfig>,
        keep_running: &'a AtomicBool,
    ) -> Self {
        Self { kms, queue, config, keep_running }
    }

    /// Run the ticked drain loop until `keep_running` is cleared (graceful
    /// shutdown) or `cancel` fires. In-flight work is not awaited past a
    /// cancel: the current item, if any, finishes its current attempt and
    /// the loop exits on the next tick boundary.
    pub fn run(&self, cancel: &CancelToken) {
        while self.keep_running.load(Ordering::SeqCst) {
            match self.tick(cancel) {
                Ok(Some(_outcome)) => {}
                Ok(None) => {}
                Err(e) => log::error!("processor: tick failed unexpectedly: {e}"),
            }
            let tick = self.config.read().unwrap().processor_tick;
            if cancel.sleep(tick) {
                break;
            }
        }
    }

    /// Dequeue and process at most one item. Returns `Ok(None)` on an empty
    /// queue.
    pub fn tick(&self, cancel: &CancelToken) -> Result<Option<Outcome>> {
        let Some(item) = self.queue.dequeue()? else { return Ok(None) };
        let outcome = self.process_one(item, cancel);
        Ok(Some(outcome))
    }

    fn process_one(&self, item: QueueItem, cancel: &CancelToken) -> Outcome {
        let cfg = self.config.read().unwrap().clone();
        let result = match item.operation {
            Operation::Encrypt => self.do_encrypt(&item, &cfg, cancel),
            Operation::Decrypt => self.do_decrypt(&item, &cfg, cancel),
        };

        match result {
            Ok(()) => {
                self.audit(&item, "completed", None);
                let _ = self.queue.complete(&item);
                self.post_process_success(&item, &cfg);
                Outcome::Completed
            }
            Err(e) if e.is_pausing() => {
                // Cancelled/Deadline: don't touch the retry count, just put
                // the item back at the tail untouched so it's retried on
                // the next tick without being penalized.
                self.audit(&item, "paused", Some(&e));
                if let Err(re) = self.queue.enqueue(item) {
                    log::error!("processor: failed to re-enqueue paused item: {re}");
                }
                Outcome::Requeued
            }
            Err(e) if !e.is_retryable() => {
                // FormatError/BoundsError: this file will not get better
                // with time. Short-circuit straight to dead-letter rather
                // than waiting out the normal backoff/retry cap.
                self.audit(&item, "failed", Some(&e));
                self.move_to_failed(&item, &cfg);
                if let Err(qe) = self.queue.dead_letter(item.clone(), &e) {
                    log::error!("processor: queue dead-letter bookkeeping failed: {qe}");
                }
                self.move_to_dead_letter(&item, &cfg);
                Outcome::DeadLettered
            }
            Err(e) => {
                // Kms/Io/Integrity: requeue with backoff. The source is
                // left where it is for a merely-transient failure -- moving
                // it into the failed directory here would leave the next
                // retry attempt looking for a file that's no longer at
                // item.source_path. Only once the item reaches its final
                // disposition (dead-lettered) does the source move, in
                // move_to_dead_letter below.
                self.audit(&item, "failed", Some(&e));
                match self.queue.requeue(item.clone(), &e) {
                    Ok(RequeueOutcome::Requeued) => Outcome::Requeued,
                    Ok(RequeueOutcome::DeadLettered) => {
                        self.move_to_dead_letter(&item, &cfg);
                        Outcome::DeadLettered
                    }
                    Err(qe) => {
                        log::error!("processor: queue requeue bookkeeping failed: {qe}");
                        Outcome::Requeued
                    }
                }
            }
        }
    }

    fn do_encrypt(&self, item: &QueueItem, cfg: &VaultCryptConfig, cancel: &CancelToken) -> Result<()> {
        let codec = FileCodec::new(cfg.chunk_size)?;
        if let Some(parent) = item.dest_path.parent() {
            crate::util::ensure_dir(parent)?;
        }
        envelope::encrypt_file(
            self.kms,
            &codec,
            &item.source_path,
            &item.dest_path,
            Some(&item.key_path),
            cfg.checksum,
            cancel,
        )
    }

    fn do_decrypt(&self, item: &QueueItem, cfg: &VaultCryptConfig, cancel: &CancelToken) -> Result<()> {
        if let Some(parent) = item.dest_path.parent() {
            crate::util::ensure_dir(parent)?;
        }
        envelope::decrypt_file(
            self.kms,
            &item.source_path,
            &item.key_path,
            &item.dest_path,
            cfg.checksum,
            cancel,
        )?;
        Ok(())
    }

    fn post_process_success(&self, item: &QueueItem, cfg: &VaultCryptConfig) {
        match cfg.on_success {
            Disposition::Archive => {
                let archive_root = item
                    .source_path
                    .parent()
                    .map(|p| p.join(&cfg.archive_dir))
                    .unwrap_or_else(|| cfg.archive_dir.clone());
                if let Err(e) = move_into(&item.source_path, &archive_root) {
                    log::warn!("processor: failed to archive {}: {e}", item.source_path.display());
                }
            }
            Disposition::Delete => best_effort_remove(&item.source_path),
            Disposition::Keep => {}
        }

        if item.operation == Operation::Decrypt {
            best_effort_remove(&item.key_path);
            if let Some(checksum_path) = &item.checksum_path {
                best_effort_remove(checksum_path);
            }
        }
    }

    fn move_to_failed(&self, item: &QueueItem, cfg: &VaultCryptConfig) {
        let failed_root = failed_root_for(&item.source_path, &cfg.failed_dir);
        if item.source_path.exists() {
            if let Err(e) = move_into(&item.source_path, &failed_root) {
                log::warn!("processor: failed to relocate {} to failed dir: {e}", item.source_path.display());
            }
        }
    }

    fn move_to_dead_letter(&self, item: &QueueItem, cfg: &VaultCryptConfig) {
        let dlq_root = failed_root_for(&item.source_path, &cfg.dead_letter_dir);
        let candidate = failed_root_for(&item.source_path, &cfg.failed_dir).join(
            item.source_path.file_name().unwrap_or_default(),
        );
        let source = if candidate.exists() { candidate.as_path() } else { item.source_path.as_path() };
        if source.exists() {
            if let Err(e) = move_into(source, &dlq_root) {
                log::warn!("processor: failed to relocate {} to dead-letter dir: {e}", source.display());
            }
        }
    }

    fn audit(&self, item: &QueueItem, outcome: &str, err: Option<&Error>) {
        match err {
            Some(e) => log::info!(
                "audit operation={:?} path={} outcome={outcome} error_kind={}",
                item.operation,
                item.source_path.display(),
                error_kind(e),
            ),
            None => log::info!(
                "audit operation={:?} path={} outcome={outcome}",
                item.operation,
                item.source_path.display(),
            ),
        }
    }
}

fn failed_root_for(source: &Path, dir_name: &Path) -> std::path::PathBuf {
    source.parent().map(|p| p.join(dir_name)).unwrap_or_else(|| dir_name.to_path_buf())
}

fn error_kind(e: &Error) -> &'static str {
    match e {
        Error::Config(_) => "config",
        Error::Kms(_) => "kms",
        Error::Io { .. } => "io",
        Error::Format(_) => "format",
        Error::Integrity(_) => "integrity",
        Error::Bounds(_) => "bounds",
        Error::Cancelled => "cancelled",
        Error::Deadline(_) => "deadline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StubKmsProvider;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn test_config(root: &Path) -> VaultCryptConfig {
        VaultCryptConfig::default().with_state_dir(root.to_path_buf())
    }

    #[test]
    fn successful_encrypt_archives_source_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, b"hello").unwrap();
        let dest = dir.path().join("out").join("a.txt.enc");

        let kms = StubKmsProvider::new();
        let queue = PersistentQueue::open(
            dir.path().join("state.json"),
            5,
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .unwrap();
        let item = QueueItem::new(
            "a",
            Operation::Encrypt,
            src.clone(),
            dest.clone(),
            dest.with_extension("enc.key"),
            None,
            5,
        );
        queue.enqueue(item).unwrap();

        let cfg = RwLock::new(test_config(dir.path()));
        let keep_running = AtomicBool::new(true);
        let processor = Processor::new(&kms, &queue, &cfg, &keep_running);
        let outcome = processor.tick(&CancelToken::new()).unwrap().unwrap();
        assert_eq!(outcome, Outcome::Completed);

        assert!(dest.exists());
        assert!(!src.exists(), "source should have been archived away");
        let archived = dir.path().join(".archive").join("a.txt");
        assert!(archived.exists());
    }

    #[test]
    fn format_error_short_circuits_to_failed_dir_without_backoff_wait() {
        let dir = tempfile::tempdir().unwrap();
        let enc = dir.path().join("bad.enc");
        std::fs::write(&enc, b"not a valid header, too short").unwrap();
        let key = dir.path().join("bad.key");
        std::fs::write(&key, "kms:v1:not-base64!!").unwrap();
        let dest = dir.path().join("bad");

        let kms = StubKmsProvider::new();
        let queue = PersistentQueue::open(
            dir.path().join("state.json"),
            1,
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
        .unwrap();
        let item = QueueItem::new("bad", Operation::Decrypt, enc.clone(), dest, key, None, 5);
        queue.enqueue(item).unwrap();

        let cfg = RwLock::new(test_config(dir.path()));
        let keep_running = AtomicBool::new(true);
        let processor = Processor::new(&kms, &queue, &cfg, &keep_running);
        let outcome = processor.tick(&CancelToken::new()).unwrap().unwrap();
        // max_retries=1 means the very first failure already hits the cap.
        assert_eq!(outcome, Outcome::DeadLettered);
    }
}
