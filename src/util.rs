//! Small filesystem helpers shared across the envelope, rewrap and service
//! layers: atomic temp+rename writes, best-effort parent-dir fsync, and
//! directory bookkeeping for post-processing dispositions.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[cfg(unix)]
pub fn fsync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn fsync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Write `contents` to `path` atomically: write to `<path>.tmp`, fsync it,
/// rename over `path`, then fsync the parent directory.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| Error::io(&tmp, e))?;
    f.write_all(contents).map_err(|e| Error::io(&tmp, e))?;
    f.sync_all().map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))?;
    let _ = fsync_parent_dir(path);
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.tmp"))
}

/// Best-effort unlink, swallowing "not found" errors. Used on rollback paths
/// where the caller cannot do anything useful with the error anyway.
pub fn best_effort_remove(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Ensure a directory exists (create_dir_all), mapping IO errors with path context.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io(path, e))
}

/// Move `src` into `dir`, preserving its file name. Creates `dir` if needed.
/// Falls back to copy+remove if the rename would cross a filesystem boundary.
pub fn move_into(src: &Path, dir: &Path) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let name = src
        .file_name()
        .ok_or_else(|| Error::Format(format!("path has no file name: {}", src.display())))?;
    let dest = dir.join(name);
    match fs::rename(src, &dest) {
        Ok(()) => Ok(dest),
        Err(_) => {
            fs::copy(src, &dest).map_err(|e| Error::io(src, e))?;
            fs::remove_file(src).map_err(|e| Error::io(src, e))?;
            Ok(dest)
        }
    }
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Constant-time byte-equality, used for checksum verification. Not for
/// secrecy (the digest isn't sensitive) but to keep audit-log timing uniform.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
