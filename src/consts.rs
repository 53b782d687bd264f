//! Wire-format constants shared by the codec, envelope and service layers.

/// Base nonce length (bytes) at the head of the `.enc` file header.
pub const NONCE_LEN: usize = 12;
/// GCM authentication tag length (bytes), appended to every chunk's ciphertext.
pub const TAG_LEN: usize = 16;

/// Fixed header: base_nonce(12) || original_size(8, BE) || chunk_size(4, BE).
pub const HEADER_LEN: usize = NONCE_LEN + 8 + 4;
/// Per-chunk length prefix (4 bytes, BE, counts the ciphertext including the tag).
pub const CHUNK_LEN_PREFIX: usize = 4;

pub const MIN_CHUNK_SIZE: u32 = 64 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 10 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Chunk indices are a 32-bit counter; a file needing this many chunks or
/// more is rejected before any KMS call is made.
pub const MAX_CHUNKS: u64 = 1u64 << 32;

/// Wrapped-key sidecar prefix: `kms:v<N>:<base64 ciphertext>`.
pub const WRAPPED_KEY_PREFIX: &str = "kms";

/// Suffixes used for sidecar files and admission filtering.
pub const ENC_EXT: &str = "enc";
pub const KEY_EXT: &str = "key";
pub const CHECKSUM_EXT: &str = "sha256";

/// Default dotted, hidden-by-default disposition directories (spec.md §9 /
/// SPEC_FULL.md §17 open-question resolution). Overridable via config.
pub const DEFAULT_ARCHIVE_DIR: &str = ".archive";
pub const DEFAULT_FAILED_DIR: &str = ".failed";
pub const DEFAULT_DEAD_LETTER_DIR: &str = ".dlq";

/// Queue state file written atomically (temp+rename) in the service root.
pub const QUEUE_STATE_FILE: &str = "queue-state.json";
pub const QUEUE_STATE_SCHEMA: u32 = 1;

/// Processor tick interval.
pub const PROCESSOR_TICK: std::time::Duration = std::time::Duration::from_secs(1);
/// Watcher re-scan interval (polling-based; the corpus has no inotify dep).
pub const WATCHER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);
/// Bounded wait for the decrypt-side `.key` sidecar to land next to a freshly
/// observed `.enc` payload.
pub const KEY_SIDECAR_WAIT: std::time::Duration = std::time::Duration::from_secs(1);
pub const KEY_SIDECAR_POLL: std::time::Duration = std::time::Duration::from_millis(100);
/// Default stability-detector deadline for a single candidate file.
pub const DEFAULT_STABILITY_DEADLINE: std::time::Duration = std::time::Duration::from_secs(300);
