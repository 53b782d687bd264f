//! SecretBuffer — scoped allocation holding a plaintext key.
//!
//! Construction page-locks the backing allocation (advisory, best-effort);
//! failure to lock is surfaced as a warning only, never a fatal error, since
//! the correctness properties (zero-on-drop, never-written-to-disk) hold
//! regardless of whether the pages are actually pinned. Destruction performs
//! a volatile overwrite with zero before unlocking and freeing.
//!
//! No API returns the plaintext by value: every consumer borrows the bytes
//! for the duration of a closure via [`SecretBuffer::with_bytes`], so a DEK
//! can never escape the buffer's scope by accident.

use zeroize::Zeroize;

pub struct SecretBuffer {
    bytes: Vec<u8>,
    locked: bool,
}

impl SecretBuffer {
    /// Allocate `len` bytes, zero-initialized, and attempt to page-lock them.
    pub fn new(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        let locked = lock_pages(&mut bytes);
        Self { bytes, locked }
    }

    /// Allocate and copy `data` in, then best-effort zero the caller's copy
    /// is the caller's responsibility — this constructor only owns the copy
    /// it makes.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.bytes.copy_from_slice(data);
        buf
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the plaintext for the duration of `f`. The slice cannot
    /// outlive this call, so callers cannot retain it past the buffer's
    /// scope.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes)
    }

    pub fn with_bytes_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes)
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        // Volatile zero: Zeroize's implementation uses a volatile write per
        // byte, defeating dead-store elimination the same way the teacher's
        // `KeyMaterial`/`EnvKeyProvider`/`EnvKmsProvider` Drop impls rely on
        // `zeroize::Zeroize` rather than a plain `for b in &mut self.bytes`.
        self.bytes.zeroize();
        if self.locked {
            unlock_pages(&mut self.bytes);
        }
    }
}

#[cfg(unix)]
fn lock_pages(bytes: &mut [u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    let rc = unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if rc != 0 {
        log::warn!(
            "SecretBuffer: mlock failed ({}); continuing without page-locking",
            std::io::Error::last_os_error()
        );
        false
    } else {
        true
    }
}

#[cfg(unix)]
fn unlock_pages(bytes: &mut [u8]) {
    if bytes.is_empty() {
        return;
    }
    let rc = unsafe { libc::munlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if rc != 0 {
        log::warn!(
            "SecretBuffer: munlock failed ({})",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn lock_pages(_bytes: &mut [u8]) -> bool {
    log::warn!("SecretBuffer: memory page-locking is not supported on this platform");
    false
}

#[cfg(not(unix))]
fn unlock_pages(_bytes: &mut [u8]) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_bytes() {
        let buf = SecretBuffer::from_slice(b"0123456789abcdef0123456789abcdef");
        assert_eq!(buf.len(), 32);
        buf.with_bytes(|b| assert_eq!(b, b"0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn zeroed_on_drop() {
        // Allocate, capture the backing pointer, drop, and reread the
        // freed region through a raw pointer (same technique the spec's
        // "memory hygiene" property calls for: a deterministic allocator
        // that can re-read freed regions). This is only sound because we
        // never deallocate the Vec's capacity via a second owner -- we
        // read the same allocation before the allocator reuses it.
        let len = 32;
        let ptr: *const u8;
        {
            let mut buf = SecretBuffer::new(len);
            buf.with_bytes_mut(|b| b.copy_from_slice(&[0xAAu8; 32]));
            ptr = buf.with_bytes(|b| b.as_ptr());
            buf.with_bytes(|b| assert_eq!(b, &[0xAAu8; 32]));
        }
        // `buf` has been dropped; the bytes were zeroized before free.
        let snapshot = unsafe { std::slice::from_raw_parts(ptr, len) };
        assert!(snapshot.iter().all(|&b| b == 0));
    }
}
