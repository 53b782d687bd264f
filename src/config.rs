//! Centralized configuration for vaultcrypt, in the same
//! default/from_env/builder shape the teacher uses for its own
//! `QuiverConfig`, plus a TOML file layer (`FileConfig`) for service mode in
//! the follower's `FileConfig`/`pick()` style: CLI overrides file overrides
//! built-in default.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::consts::{
    DEFAULT_ARCHIVE_DIR, DEFAULT_CHUNK_SIZE, DEFAULT_DEAD_LETTER_DIR, DEFAULT_FAILED_DIR,
    DEFAULT_STABILITY_DEADLINE, PROCESSOR_TICK, WATCHER_POLL_INTERVAL,
};
use crate::error::{Error, Result};

/// Top-level runtime configuration, shared by the one-shot CLI commands and
/// the service-mode watcher/processor pipeline.
#[derive(Clone, Debug)]
pub struct VaultCryptConfig {
    /// Vault transit endpoint, e.g. `https://vault.internal:8200`.
    /// Env: VAULTCRYPT_KMS_ENDPOINT
    pub kms_endpoint: Option<String>,

    /// Vault token used for transit calls.
    /// Env: VAULTCRYPT_KMS_TOKEN
    pub kms_token: Option<String>,

    /// Name of the transit key this instance wraps/unwraps/rewraps under.
    /// Env: VAULTCRYPT_KMS_KEY_NAME (default "vaultcrypt")
    pub kms_key_name: String,

    /// Chunk size for the streaming codec, in bytes.
    /// Env: VAULTCRYPT_CHUNK_SIZE (default 1 MiB)
    pub chunk_size: u32,

    /// Whether to write a `.sha256` checksum sidecar on encrypt and verify
    /// it (when present) on decrypt.
    /// Env: VAULTCRYPT_CHECKSUM (default true)
    pub checksum: bool,

    /// Encrypt-side root watched in service mode: plain files dropped here
    /// are encrypted in place (spec.md §4.10's "encrypt root").
    /// Env: VAULTCRYPT_WATCH_DIR
    pub watch_dir: Option<PathBuf>,

    /// Decrypt-side root watched in service mode: `.enc` files (with a
    /// sibling `.key`) dropped here are decrypted in place (spec.md §4.10's
    /// "decrypt root"). Service mode runs a watcher thread per configured
    /// root; a deployment may set either, both, or neither.
    /// Env: VAULTCRYPT_DECRYPT_DIR
    pub decrypt_dir: Option<PathBuf>,

    /// Poll interval for the directory watcher.
    /// Env: VAULTCRYPT_POLL_MS (default 2000)
    pub poll_interval: Duration,

    /// How long two (size, mtime) observations must be stable before a file
    /// is admitted to the queue.
    /// Env: VAULTCRYPT_STABILITY_WINDOW_MS (default 2000, same cadence as
    /// the poll interval unless overridden)
    pub stability_window: Duration,

    /// Deadline after which a file stuck in "not yet stable" is logged and
    /// retried rather than waited on indefinitely.
    pub stability_deadline: Duration,

    /// Tick interval for the processor's queue-draining loop.
    pub processor_tick: Duration,

    /// Directory successfully-processed sources are archived into, relative
    /// to the watched directory.
    pub archive_dir: PathBuf,

    /// Directory sources that exhausted retries are moved into.
    pub failed_dir: PathBuf,

    /// Final resting place for items that transitioned to `dead`: exceeded
    /// the retry cap and were evicted from the FIFO.
    pub dead_letter_dir: PathBuf,

    /// Maximum retry attempts before an item is dead-lettered. `-1` (stored
    /// as `None` here) means unbounded — the dead transition is never taken.
    /// Env: VAULTCRYPT_MAX_RETRIES (default 5)
    pub max_retries: i64,

    /// Base delay for the queue's exponential backoff (attempt 1 waits this
    /// long; attempt N waits `base_delay * 2^(N-1)`, capped at `max_delay`).
    pub base_delay: Duration,

    /// Ceiling on the exponential backoff delay.
    pub max_delay: Duration,

    /// Directory service-mode queue state is persisted under (the
    /// `queue-state.json` snapshot lives here).
    pub state_dir: PathBuf,

    /// Directory `decrypt` output lands in, relative to the watch dir, when
    /// distinct from the source root. Defaults to the watch dir itself.
    pub output_dir: Option<PathBuf>,

    /// What to do with a source file after it's processed successfully.
    pub on_success: Disposition,

    /// Names of fields a builder (`with_*`) call has explicitly set, so
    /// [`Self::merge_file`] can tell a deliberate override from an
    /// untouched default for the handful of fields that aren't themselves
    /// `Option<T>` (chunk_size, checksum, max_retries, state_dir). Mirrors
    /// the same "explicit > file > default" precedence the `Option` fields
    /// already get for free from `is_none()`.
    explicit: HashSet<&'static str>,
}

/// Post-processing behavior applied to a source file once the Processor
/// finishes with it successfully (spec.md §4.9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Archive,
    Delete,
    Keep,
}

impl Default for Disposition {
    fn default() -> Self {
        Disposition::Archive
    }
}

impl std::str::FromStr for Disposition {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "archive" => Ok(Disposition::Archive),
            "delete" => Ok(Disposition::Delete),
            "keep" => Ok(Disposition::Keep),
            other => Err(Error::Config(format!("unknown disposition '{other}'"))),
        }
    }
}

impl Default for VaultCryptConfig {
    fn default() -> Self {
        Self {
            kms_endpoint: None,
            kms_token: None,
            kms_key_name: "vaultcrypt".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: true,
            watch_dir: None,
            decrypt_dir: None,
            poll_interval: WATCHER_POLL_INTERVAL,
            stability_window: WATCHER_POLL_INTERVAL,
            stability_deadline: DEFAULT_STABILITY_DEADLINE,
            processor_tick: PROCESSOR_TICK,
            archive_dir: PathBuf::from(DEFAULT_ARCHIVE_DIR),
            failed_dir: PathBuf::from(DEFAULT_FAILED_DIR),
            dead_letter_dir: PathBuf::from(DEFAULT_DEAD_LETTER_DIR),
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            state_dir: PathBuf::from("."),
            output_dir: None,
            on_success: Disposition::default(),
            explicit: HashSet::new(),
        }
    }
}

impl VaultCryptConfig {
    /// Load configuration from environment variables, falling back to
    /// built-in defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("VAULTCRYPT_KMS_ENDPOINT") {
            cfg.kms_endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_KMS_TOKEN") {
            cfg.kms_token = Some(v);
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_KMS_KEY_NAME") {
            cfg.kms_key_name = v;
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_CHUNK_SIZE") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.chunk_size = n;
                cfg.explicit.insert("chunk_size");
            }
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_CHECKSUM") {
            let s = v.trim().to_ascii_lowercase();
            cfg.checksum = !(s == "0" || s == "false" || s == "off" || s == "no");
            cfg.explicit.insert("checksum");
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_WATCH_DIR") {
            cfg.watch_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_DECRYPT_DIR") {
            cfg.decrypt_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_POLL_MS") {
            if let Ok(ms) = v.trim().parse::<u64>() {
                cfg.poll_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_MAX_RETRIES") {
            if let Ok(n) = v.trim().parse::<i64>() {
                cfg.max_retries = n;
                cfg.explicit.insert("max_retries");
            }
        }
        if let Ok(v) = std::env::var("VAULTCRYPT_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
            cfg.explicit.insert("state_dir");
        }

        cfg
    }

    /// Layer a parsed TOML file over `self`, CLI/env values winning where
    /// already set (same precedence as the follower's `pick()` helper:
    /// explicit value > file value > default).
    pub fn merge_file(mut self, file: FileConfig) -> Self {
        if self.kms_endpoint.is_none() {
            self.kms_endpoint = file.kms_endpoint;
        }
        if self.kms_token.is_none() {
            self.kms_token = file.kms_token;
        }
        if let Some(v) = file.kms_key_name {
            self.kms_key_name = v;
        }
        if let Some(v) = file.chunk_size {
            if !self.explicit.contains("chunk_size") {
                self.chunk_size = v;
            }
        }
        if let Some(v) = file.checksum {
            if !self.explicit.contains("checksum") {
                self.checksum = v;
            }
        }
        if self.watch_dir.is_none() {
            self.watch_dir = file.watch_dir;
        }
        if self.decrypt_dir.is_none() {
            self.decrypt_dir = file.decrypt_dir;
        }
        if let Some(ms) = file.poll_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.stability_window_ms {
            self.stability_window = Duration::from_millis(ms);
        }
        if let Some(ms) = file.stability_deadline_ms {
            self.stability_deadline = Duration::from_millis(ms);
        }
        if let Some(dir) = file.archive_dir {
            self.archive_dir = dir;
        }
        if let Some(dir) = file.failed_dir {
            self.failed_dir = dir;
        }
        if let Some(dir) = file.dead_letter_dir {
            self.dead_letter_dir = dir;
        }
        if let Some(n) = file.max_retries {
            if !self.explicit.contains("max_retries") {
                self.max_retries = n;
            }
        }
        if let Some(ms) = file.base_delay_ms {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.max_delay_ms {
            self.max_delay = Duration::from_millis(ms);
        }
        if let Some(dir) = file.state_dir {
            if !self.explicit.contains("state_dir") {
                self.state_dir = dir;
            }
        }
        if let Some(dir) = file.output_dir {
            self.output_dir = Some(dir);
        }
        if let Some(d) = file.on_success {
            self.on_success = d;
        }
        self
    }

    /// Parse and merge a TOML config file at `path`.
    pub fn load_file(self, path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let file: FileConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(self.merge_file(file))
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self.explicit.insert("chunk_size");
        self
    }

    pub fn with_checksum(mut self, on: bool) -> Self {
        self.checksum = on;
        self.explicit.insert("checksum");
        self
    }

    pub fn with_max_retries(mut self, n: i64) -> Self {
        self.max_retries = n;
        self.explicit.insert("max_retries");
        self
    }

    pub fn with_watch_dir(mut self, dir: PathBuf) -> Self {
        self.watch_dir = Some(dir);
        self
    }

    pub fn with_decrypt_dir(mut self, dir: PathBuf) -> Self {
        self.decrypt_dir = Some(dir);
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self.explicit.insert("state_dir");
        self
    }

    pub fn queue_state_path(&self) -> PathBuf {
        self.state_dir.join(crate::consts::QUEUE_STATE_FILE)
    }
}

/// Deserialized shape of a `--config` TOML file. Every field optional so a
/// partial file only overrides what it mentions.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub kms_endpoint: Option<String>,
    pub kms_token: Option<String>,
    pub kms_key_name: Option<String>,
    pub chunk_size: Option<u32>,
    pub checksum: Option<bool>,
    pub watch_dir: Option<PathBuf>,
    pub decrypt_dir: Option<PathBuf>,
    pub poll_ms: Option<u64>,
    pub stability_window_ms: Option<u64>,
    pub stability_deadline_ms: Option<u64>,
    pub archive_dir: Option<PathBuf>,
    pub failed_dir: Option<PathBuf>,
    pub dead_letter_dir: Option<PathBuf>,
    pub max_retries: Option<i64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub state_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub on_success: Option<Disposition>,
}

impl fmt::Display for VaultCryptConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VaultCryptConfig {{ kms_key_name: {}, chunk_size: {}, checksum: {}, max_retries: {} }}",
            self.kms_key_name, self.chunk_size, self.checksum, self.max_retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = VaultCryptConfig::default();
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(cfg.checksum);
        assert_eq!(cfg.max_retries, 5);
    }

    #[test]
    fn file_values_fill_in_unset_fields_only() {
        let cfg = VaultCryptConfig::default()
            .with_chunk_size(2_097_152)
            .merge_file(FileConfig {
                chunk_size: Some(4_194_304),
                max_retries: Some(9),
                ..Default::default()
            });
        // explicit builder value wins over the file value
        assert_eq!(cfg.chunk_size, 2_097_152);
        // file value fills in what wasn't explicitly set
        assert_eq!(cfg.max_retries, 9);
    }

    #[test]
    fn load_file_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultcrypt.toml");
        std::fs::write(
            &path,
            r#"
            kms_key_name = "file-key"
            chunk_size = 2097152
            max_retries = 3
            "#,
        )
        .unwrap();
        let cfg = VaultCryptConfig::default().load_file(&path).unwrap();
        assert_eq!(cfg.kms_key_name, "file-key");
        assert_eq!(cfg.chunk_size, 2_097_152);
        assert_eq!(cfg.max_retries, 3);
    }
}
