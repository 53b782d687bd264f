//! Black-box tests for the key-rotation CLI path: scan .key sidecars,
//! rewrap the ones behind a minimum version, and restore from backup when
//! the KMS call fails partway through a batch.

use std::path::Path;

use vaultcrypt::crypto::{KmsProvider, StubKmsProvider, WrappedKey};
use vaultcrypt::error::{Error, KmsError, Result};
use vaultcrypt::rewrap::Rewrapper;
use vaultcrypt::secret::SecretBuffer;

fn write_key_file(dir: &Path, name: &str, wrapped: &WrappedKey) {
    std::fs::write(dir.join(name), wrapped.as_str()).unwrap();
}

#[test]
fn scan_and_rewrap_moves_every_stale_key_to_the_current_version() {
    let dir = tempfile::tempdir().unwrap();
    let kms = StubKmsProvider::new();

    let (_dek_a, wrapped_a) = kms.wrap().unwrap();
    let (_dek_b, wrapped_b) = kms.wrap().unwrap();
    write_key_file(dir.path(), "a.bin.key", &wrapped_a);
    write_key_file(dir.path(), "b.bin.key", &wrapped_b);

    kms.bump_version();
    kms.bump_version();
    let current = kms.current_version();
    assert_eq!(current, 3);

    let found = Rewrapper::scan_key_files(dir.path(), false).unwrap();
    assert_eq!(found.len(), 2);

    let rewrapper = Rewrapper::new(&kms);
    let report = rewrapper.run(dir.path(), false, current, false, true).unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.exit_code(), 0);

    for name in ["a.bin.key", "b.bin.key"] {
        let raw = std::fs::read_to_string(dir.path().join(name)).unwrap();
        let wrapped = WrappedKey::parse(&raw).unwrap();
        assert_eq!(wrapped.version(), current);
        // Successful rewrap cleans up its backup.
        assert!(!dir.path().join(format!("{name}.bak")).exists());
    }
}

#[test]
fn below_minimum_version_keys_are_left_untouched_when_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let kms = StubKmsProvider::new();
    let (_dek, wrapped) = kms.wrap().unwrap();
    write_key_file(dir.path(), "current.bin.key", &wrapped);

    let rewrapper = Rewrapper::new(&kms);
    // min_version equal to the file's own version: nothing needs rewrapping.
    let report = rewrapper.run(dir.path(), false, wrapped.version(), false, true).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.successful, 0);

    let raw = std::fs::read_to_string(dir.path().join("current.bin.key")).unwrap();
    assert_eq!(raw, wrapped.as_str());
}

#[test]
fn dry_run_reports_without_writing_anything() {
    let dir = tempfile::tempdir().unwrap();
    let kms = StubKmsProvider::new();
    let (_dek, wrapped) = kms.wrap().unwrap();
    write_key_file(dir.path(), "a.bin.key", &wrapped);
    kms.bump_version();

    let rewrapper = Rewrapper::new(&kms);
    let report = rewrapper.run(dir.path(), false, kms.current_version(), true, true).unwrap();
    assert_eq!(report.would_rewrap, 1);
    assert_eq!(report.successful, 0);

    let raw = std::fs::read_to_string(dir.path().join("a.bin.key")).unwrap();
    assert_eq!(raw, wrapped.as_str(), "dry run must not modify the sidecar");
    assert!(!dir.path().join("a.bin.key.bak").exists());
}

/// A KmsProvider whose `rewrap` always fails, to exercise the
/// backup-then-restore-on-failure path.
struct AlwaysFailsRewrap {
    inner: StubKmsProvider,
}

impl KmsProvider for AlwaysFailsRewrap {
    fn wrap(&self) -> Result<(SecretBuffer, WrappedKey)> {
        self.inner.wrap()
    }
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<SecretBuffer> {
        self.inner.unwrap(wrapped)
    }
    fn rewrap(&self, _wrapped: &WrappedKey) -> Result<WrappedKey> {
        Err(Error::Kms(KmsError::Unreachable("kms down mid-rotation".into())))
    }
    fn health(&self) -> Result<()> {
        self.inner.health()
    }
}

#[test]
fn failed_rewrap_restores_the_original_sidecar_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let stub = StubKmsProvider::new();
    let (_dek, wrapped) = stub.wrap().unwrap();
    write_key_file(dir.path(), "a.bin.key", &wrapped);
    stub.bump_version();

    let kms = AlwaysFailsRewrap { inner: stub };
    let rewrapper = Rewrapper::new(&kms);
    let report = rewrapper.run(dir.path(), false, 2, false, true).unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.successful, 0);
    assert_eq!(report.exit_code(), 2);

    let raw = std::fs::read_to_string(dir.path().join("a.bin.key")).unwrap();
    assert_eq!(raw, wrapped.as_str(), "original sidecar must survive a failed rewrap untouched");
}
