//! Envelope — the glue between KmsClient and FileCodec: obtain a DEK, run
//! the codec, persist the wrapped DEK, dispose of the plaintext. This is
//! the module every CLI command and the service-mode Processor call into;
//! neither touches KmsProvider or FileCodec directly.
//!
//! Sidecar naming (SPEC_FULL.md §17): both the `.key` and `.sha256` sidecars
//! are named after the *pre-encryption* basename, not the `.enc` path — on
//! encrypt they sit beside the destination using the source's basename; on
//! decrypt they sit beside the `.enc` source with its `.enc` suffix dropped.
//! This is what lets a destination's sidecars and a source's sidecars agree
//! on a name without either side needing to know the other's path.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::consts::{CHECKSUM_EXT, ENC_EXT, KEY_EXT};
use crate::crypto::{checksum, FileCodec, KmsProvider};
use crate::error::{Error, Result};
use crate::util::{atomic_write, best_effort_remove};

/// Where the `.key` sidecar for an encrypt of `source` into `dest` lands by
/// default (no `--key` override): `dest`'s directory, `source`'s basename.
pub fn encrypt_side_key_sidecar(source: &Path, dest: &Path) -> PathBuf {
    sidecar_for_encrypt(source, dest, KEY_EXT)
}

/// Where the checksum sidecar for an encrypt of `source` into `dest` lands:
/// `dest`'s directory, `source`'s basename.
pub fn encrypt_side_checksum_sidecar(source: &Path, dest: &Path) -> PathBuf {
    sidecar_for_encrypt(source, dest, CHECKSUM_EXT)
}

fn sidecar_for_encrypt(source: &Path, dest: &Path, ext: &str) -> PathBuf {
    let basename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("{basename}.{ext}"))
}

/// Where the `.key` sidecar for a decrypt of `enc_path` lives: beside
/// `enc_path`, named after its basename with the `.enc` suffix stripped.
pub fn decrypt_side_key_sidecar(enc_path: &Path) -> PathBuf {
    sidecar_for_decrypt(enc_path, KEY_EXT)
}

/// Where the checksum sidecar for a decrypt of `enc_path` lives: beside
/// `enc_path`, named after its basename with the `.enc` suffix stripped.
pub fn decrypt_side_checksum_sidecar(enc_path: &Path) -> PathBuf {
    sidecar_for_decrypt(enc_path, CHECKSUM_EXT)
}

fn sidecar_for_decrypt(enc_path: &Path, ext: &str) -> PathBuf {
    let basename = enc_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let without_ext = basename.strip_suffix(&format!(".{ENC_EXT}")).unwrap_or(&basename);
    enc_path.with_file_name(format!("{without_ext}.{ext}"))
}

/// Encrypt `source` into `dest` under a freshly-wrapped DEK, writing a `.key`
/// sidecar (at `key_path`, or the default sibling-of-`dest` location if
/// `None`) and, if `write_checksum`, a `.sha256` sidecar. On any failure
/// after the destination or sidecars were created, they are best-effort
/// removed so a caller never observes a half-written envelope. The source
/// file is never mutated.
pub fn encrypt_file(
    kms: &dyn KmsProvider,
    codec: &FileCodec,
    source: &Path,
    dest: &Path,
    key_path: Option<&Path>,
    write_checksum: bool,
    cancel: &CancelToken,
) -> Result<()> {
    let key_path = key_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| encrypt_side_key_sidecar(source, dest));
    let checksum_path = encrypt_side_checksum_sidecar(source, dest);

    let result = encrypt_file_inner(kms, codec, source, dest, &key_path, write_checksum, &checksum_path, cancel);
    if result.is_err() {
        best_effort_remove(dest);
        best_effort_remove(&key_path);
        if write_checksum {
            best_effort_remove(&checksum_path);
        }
    }
    result
}

fn encrypt_file_inner(
    kms: &dyn KmsProvider,
    codec: &FileCodec,
    source: &Path,
    dest: &Path,
    key_path: &Path,
    write_checksum: bool,
    checksum_path: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    if write_checksum {
        checksum::save(source, checksum_path)?;
    }

    let (dek, wrapped) = kms.wrap()?;

    let plaintext_len = std::fs::metadata(source)
        .map_err(|e| Error::io(source, e))?
        .len();
    let reader = File::open(source).map_err(|e| Error::io(source, e))?;
    let writer = File::create(dest).map_err(|e| Error::io(dest, e))?;

    let encrypt_result = dek.with_bytes(|key| codec.encrypt(key, plaintext_len, reader, writer, cancel));
    encrypt_result?;

    atomic_write(key_path, wrapped.as_str().as_bytes())?;
    Ok(())
}

/// Outcome of a checksum check on decrypt: `Verified` (sidecar present and
/// matched), `Skipped` (verification not requested), or `Missing` (caller
/// asked to verify but no sidecar exists — a warning, never an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOutcome {
    Verified,
    Skipped,
    Missing,
}

/// Decrypt `source` (a `.enc` file) into `dest` using the wrapped key at
/// `key_path`. If `verify_checksum`, the checksum sidecar beside `source`
/// (pre-`.enc`-basename, see module docs) is compared against the decrypted
/// output; a missing sidecar is reported via [`ChecksumOutcome::Missing`]
/// rather than failing.
pub fn decrypt_file(
    kms: &dyn KmsProvider,
    source: &Path,
    key_path: &Path,
    dest: &Path,
    verify_checksum: bool,
    cancel: &CancelToken,
) -> Result<ChecksumOutcome> {
    let checksum_path = decrypt_side_checksum_sidecar(source);

    let result = decrypt_file_inner(kms, source, key_path, dest, verify_checksum, &checksum_path, cancel);
    if result.is_err() {
        best_effort_remove(dest);
    }
    result
}

fn decrypt_file_inner(
    kms: &dyn KmsProvider,
    source: &Path,
    key_path: &Path,
    dest: &Path,
    verify_checksum: bool,
    checksum_path: &Path,
    cancel: &CancelToken,
) -> Result<ChecksumOutcome> {
    let wrapped_str = std::fs::read_to_string(key_path).map_err(|e| Error::io(key_path, e))?;
    let wrapped = crate::crypto::WrappedKey::parse(&wrapped_str)?;

    let dek = kms.unwrap(&wrapped)?;

    let reader = File::open(source).map_err(|e| Error::io(source, e))?;
    let writer = File::create(dest).map_err(|e| Error::io(dest, e))?;
    dek.with_bytes(|key| FileCodec::decrypt(key, reader, writer, cancel))?;

    if !verify_checksum {
        return Ok(ChecksumOutcome::Skipped);
    }
    if !checksum_path.exists() {
        log::warn!(
            "checksum sidecar {} not found; skipping verification",
            checksum_path.display()
        );
        return Ok(ChecksumOutcome::Missing);
    }
    checksum::verify(dest, checksum_path)?;
    Ok(ChecksumOutcome::Verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StubKmsProvider;

    #[test]
    fn sidecar_paths_use_pre_encryption_basename() {
        let source = Path::new("/tmp/in/report.pdf");
        let dest = Path::new("/tmp/out/report.pdf.enc");
        assert_eq!(
            encrypt_side_key_sidecar(source, dest),
            Path::new("/tmp/out/report.pdf.key")
        );
        assert_eq!(
            encrypt_side_checksum_sidecar(source, dest),
            Path::new("/tmp/out/report.pdf.sha256")
        );
        assert_eq!(
            decrypt_side_key_sidecar(dest),
            Path::new("/tmp/out/report.pdf.key")
        );
        assert_eq!(
            decrypt_side_checksum_sidecar(dest),
            Path::new("/tmp/out/report.pdf.sha256")
        );
    }

    #[test]
    fn encrypt_then_decrypt_roundtrip_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.txt");
        std::fs::write(&src, b"the quick brown fox").unwrap();

        let kms = StubKmsProvider::new();
        let codec = FileCodec::with_default_chunk_size();
        let cancel = CancelToken::new();

        let enc = dir.path().join("plain.txt.enc");
        encrypt_file(&kms, &codec, &src, &enc, None, true, &cancel).unwrap();
        let key_path = encrypt_side_key_sidecar(&src, &enc);
        let checksum_path = encrypt_side_checksum_sidecar(&src, &enc);
        assert!(key_path.exists());
        assert!(checksum_path.exists());
        assert_eq!(key_path, dir.path().join("plain.txt.key"));

        let dec = dir.path().join("plain.txt.dec");
        let outcome = decrypt_file(&kms, &enc, &key_path, &dec, true, &cancel).unwrap();
        assert_eq!(outcome, ChecksumOutcome::Verified);
        assert_eq!(std::fs::read(&dec).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn decrypt_reports_missing_checksum_sidecar_as_warning_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.txt");
        std::fs::write(&src, b"payload").unwrap();

        let kms = StubKmsProvider::new();
        let codec = FileCodec::with_default_chunk_size();
        let cancel = CancelToken::new();

        let enc = dir.path().join("plain.txt.enc");
        encrypt_file(&kms, &codec, &src, &enc, None, false, &cancel).unwrap();
        let key_path = encrypt_side_key_sidecar(&src, &enc);
        assert!(!decrypt_side_checksum_sidecar(&enc).exists());

        let dec = dir.path().join("plain.txt.dec");
        let outcome = decrypt_file(&kms, &enc, &key_path, &dec, true, &cancel).unwrap();
        assert_eq!(outcome, ChecksumOutcome::Missing);
    }

    #[test]
    fn explicit_key_path_override_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plain.txt");
        std::fs::write(&src, b"payload").unwrap();
        let custom_key = dir.path().join("custom.key");

        let kms = StubKmsProvider::new();
        let codec = FileCodec::with_default_chunk_size();
        let cancel = CancelToken::new();

        let enc = dir.path().join("plain.txt.enc");
        encrypt_file(&kms, &codec, &src, &enc, Some(&custom_key), false, &cancel).unwrap();
        assert!(custom_key.exists());
        assert!(!encrypt_side_key_sidecar(&src, &enc).exists());

        let dec = dir.path().join("plain.txt.dec");
        decrypt_file(&kms, &enc, &custom_key, &dec, false, &cancel).unwrap();
        assert_eq!(std::fs::read(&dec).unwrap(), b"payload");
    }

    #[test]
    fn encrypt_failure_leaves_no_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing-source.txt");
        let kms = StubKmsProvider::new();
        let codec = FileCodec::with_default_chunk_size();
        let cancel = CancelToken::new();

        let enc = dir.path().join("out.enc");
        let err = encrypt_file(&kms, &codec, &src, &enc, None, true, &cancel).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!enc.exists());
        assert!(!encrypt_side_key_sidecar(&src, &enc).exists());
        assert!(!encrypt_side_checksum_sidecar(&src, &enc).exists());
    }
}
