//! Whole-file SHA-256 checksum: compute, save, verify.
//!
//! Sidecar format: lowercase hex digest, no trailing newline on write;
//! readers tolerate trailing whitespace.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::util::{atomic_write, constant_time_eq, hex_encode};

const READ_BUF: usize = 64 * 1024;

/// SHA-256 of the full contents of `path`, as lowercase hex.
pub fn compute(path: &Path) -> Result<String> {
    let mut f = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = f.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Compute the checksum of `path` and write it atomically to `sidecar`.
pub fn save(path: &Path, sidecar: &Path) -> Result<String> {
    let digest = compute(path)?;
    atomic_write(sidecar, digest.as_bytes())?;
    Ok(digest)
}

/// Read a checksum sidecar, tolerating trailing whitespace.
pub fn read_sidecar(sidecar: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(sidecar).map_err(|e| Error::io(sidecar, e))?;
    Ok(raw.trim().to_ascii_lowercase())
}

/// Recompute `path`'s checksum and compare it (constant-time) against the
/// digest stored in `sidecar`. Returns Ok(()) on match, IntegrityError on
/// mismatch.
pub fn verify(path: &Path, sidecar: &Path) -> Result<()> {
    let expected = read_sidecar(sidecar)?;
    let actual = compute(path)?;
    if constant_time_eq(expected.as_bytes(), actual.as_bytes()) {
        Ok(())
    } else {
        Err(Error::Integrity(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )))
    }
}
