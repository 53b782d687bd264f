//! Rewrapper — re-wrap `.key` sidecars to a newer KMS key version without
//! touching the ciphertext payloads they sit next to.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::crypto::{KmsProvider, WrappedKey};
use crate::error::{Error, Result};
use crate::util::{atomic_write, best_effort_remove};

/// Derived from a `.key` file's contents: path, wrapped ciphertext, parsed
/// version, and whether it falls below a policy's minimum version.
#[derive(Debug, Clone, Serialize)]
pub struct KeyVersionInfo {
    pub path: PathBuf,
    pub wrapped: String,
    pub version: u32,
    pub needs_rewrap: bool,
}

impl KeyVersionInfo {
    pub fn load(path: &Path, min_version: u32) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let wrapped = WrappedKey::parse(&raw)?;
        Ok(Self {
            path: path.to_path_buf(),
            wrapped: wrapped.as_str().to_string(),
            version: wrapped.version(),
            needs_rewrap: wrapped.version() < min_version,
        })
    }
}

/// Outcome of attempting to rewrap one `.key` file.
#[derive(Debug, Clone, Serialize)]
pub struct RewrapResult {
    pub path: PathBuf,
    pub old_version: u32,
    pub new_version: u32,
    pub old_ciphertext: String,
    pub new_ciphertext: String,
    pub backed_up: bool,
    pub error: Option<String>,
}

impl RewrapResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Rewrapped,
    Skipped,
    WouldRewrap,
    Failed,
}

/// Scan `root` for `.key` files (recursively if `recursive`), optionally
/// dry-running, and re-wrap anything below `min_version`.
pub struct Rewrapper<'a> {
    kms: &'a dyn KmsProvider,
}

impl<'a> Rewrapper<'a> {
    pub fn new(kms: &'a dyn KmsProvider) -> Self {
        Self { kms }
    }

    /// Enumerate `.key` files under `root`. `recursive` walks subdirectories;
    /// otherwise only `root` itself is scanned.
    pub fn scan_key_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        scan_key_files_into(root, recursive, &mut out)?;
        out.sort();
        Ok(out)
    }

    /// Rewrap every `.key` file under `root` whose version is below
    /// `min_version`. See module docs for the per-file protocol.
    pub fn run(
        &self,
        root: &Path,
        recursive: bool,
        min_version: u32,
        dry_run: bool,
        backup: bool,
    ) -> Result<RewrapReport> {
        let files = Self::scan_key_files(root, recursive)?;
        let mut report = RewrapReport::default();
        for path in files {
            self.accumulate(&mut report, &path, min_version, dry_run, backup);
        }
        Ok(report)
    }

    /// Rewrap exactly one `.key` file, for the CLI's `--key-file` mode.
    pub fn run_single(&self, path: &Path, min_version: u32, dry_run: bool, backup: bool) -> Result<RewrapReport> {
        let mut report = RewrapReport::default();
        self.accumulate(&mut report, path, min_version, dry_run, backup);
        Ok(report)
    }

    fn accumulate(&self, report: &mut RewrapReport, path: &Path, min_version: u32, dry_run: bool, backup: bool) {
        report.total += 1;
        match self.rewrap_one(path, min_version, dry_run, backup) {
            (Disposition::Skipped, RewrapResultOrInfo::Info(info)) => {
                report.skipped += 1;
                *report.version_histogram.entry(info.version).or_insert(0) += 1;
            }
            (Disposition::WouldRewrap, RewrapResultOrInfo::Info(info)) => {
                report.would_rewrap += 1;
                *report.version_histogram.entry(info.version).or_insert(0) += 1;
            }
            (Disposition::Rewrapped, RewrapResultOrInfo::Result(result)) => {
                *report.version_histogram.entry(result.new_version).or_insert(0) += 1;
                report.successful += 1;
                report.results.push(result);
            }
            (Disposition::Failed, RewrapResultOrInfo::Result(result)) => {
                *report.version_histogram.entry(result.old_version).or_insert(0) += 1;
                report.failed += 1;
                report.results.push(result);
            }
            (disposition, _) => unreachable!("rewrap_one returned an impossible payload for {disposition:?}"),
        }
    }

    fn rewrap_one(
        &self,
        path: &Path,
        min_version: u32,
        dry_run: bool,
        backup: bool,
    ) -> (Disposition, RewrapResultOrInfo) {
        let info = match KeyVersionInfo::load(path, min_version) {
            Ok(info) => info,
            Err(e) => {
                return (
                    Disposition::Failed,
                    RewrapResultOrInfo::Result(RewrapResult {
                        path: path.to_path_buf(),
                        old_version: 0,
                        new_version: 0,
                        old_ciphertext: String::new(),
                        new_ciphertext: String::new(),
                        backed_up: false,
                        error: Some(e.to_string()),
                    }),
                )
            }
        };

        if !info.needs_rewrap {
            return (Disposition::Skipped, RewrapResultOrInfo::Info(info));
        }
        if dry_run {
            return (Disposition::WouldRewrap, RewrapResultOrInfo::Info(info));
        }

        let backup_path = path.with_extension("key.bak");
        let mut backed_up = false;
        if backup {
            if let Err(e) = std::fs::copy(path, &backup_path) {
                return (
                    Disposition::Failed,
                    RewrapResultOrInfo::Result(RewrapResult {
                        path: path.to_path_buf(),
                        old_version: info.version,
                        new_version: info.version,
                        old_ciphertext: info.wrapped.clone(),
                        new_ciphertext: String::new(),
                        backed_up: false,
                        error: Some(format!("backup failed: {e}")),
                    }),
                );
            }
            backed_up = true;
        }

        let old_wrapped = match WrappedKey::parse(&info.wrapped) {
            Ok(w) => w,
            Err(e) => {
                return (
                    Disposition::Failed,
                    RewrapResultOrInfo::Result(RewrapResult {
                        path: path.to_path_buf(),
                        old_version: info.version,
                        new_version: info.version,
                        old_ciphertext: info.wrapped.clone(),
                        new_ciphertext: String::new(),
                        backed_up,
                        error: Some(e.to_string()),
                    }),
                )
            }
        };

        match self
            .kms
            .rewrap(&old_wrapped)
            .and_then(|new_wrapped| atomic_write(path, new_wrapped.as_str().as_bytes()).map(|()| new_wrapped))
        {
            Ok(new_wrapped) => {
                if backed_up {
                    best_effort_remove(&backup_path);
                }
                (
                    Disposition::Rewrapped,
                    RewrapResultOrInfo::Result(RewrapResult {
                        path: path.to_path_buf(),
                        old_version: info.version,
                        new_version: new_wrapped.version(),
                        old_ciphertext: info.wrapped.clone(),
                        new_ciphertext: new_wrapped.as_str().to_string(),
                        backed_up,
                        error: None,
                    }),
                )
            }
            Err(e) => {
                if backed_up {
                    if let Err(restore_err) = std::fs::copy(&backup_path, path) {
                        log::error!(
                            "rewrap failed AND backup restore failed for {}: {} (original error: {})",
                            path.display(),
                            restore_err,
                            e
                        );
                    }
                }
                (
                    Disposition::Failed,
                    RewrapResultOrInfo::Result(RewrapResult {
                        path: path.to_path_buf(),
                        old_version: info.version,
                        new_version: info.version,
                        old_ciphertext: info.wrapped.clone(),
                        new_ciphertext: String::new(),
                        backed_up,
                        error: Some(e.to_string()),
                    }),
                )
            }
        }
    }
}

enum RewrapResultOrInfo {
    Result(RewrapResult),
    Info(KeyVersionInfo),
}

fn scan_key_files_into(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
        if file_type.is_dir() {
            if recursive {
                scan_key_files_into(&path, recursive, out)?;
            }
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(crate::consts::KEY_EXT) {
            out.push(path);
        }
    }
    Ok(())
}

/// Aggregate report of one rewrap or key-versions run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RewrapReport {
    pub total: usize,
    pub successful: usize,
    pub skipped: usize,
    pub would_rewrap: usize,
    pub failed: usize,
    pub version_histogram: std::collections::BTreeMap<u32, usize>,
    pub results: Vec<RewrapResult>,
}

impl RewrapReport {
    /// Exit-code policy: 0 all-success, 1 partial-success, 2 total-failure.
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else if self.successful > 0 || self.skipped > 0 || self.would_rewrap > 0 {
            1
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
}

impl std::str::FromStr for ReportFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(ReportFormat::Text),
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(Error::Config(format!("unknown report format '{other}'"))),
        }
    }
}

pub fn render_report(report: &RewrapReport, format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|e| Error::Format(format!("serializing rewrap report: {e}"))),
        ReportFormat::Csv => Ok(render_csv(report)),
    }
}

fn render_text(report: &RewrapReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "total={} successful={} skipped={} would_rewrap={} failed={}",
        report.total, report.successful, report.skipped, report.would_rewrap, report.failed
    );
    let _ = write!(out, "versions:");
    for (version, count) in &report.version_histogram {
        let _ = write!(out, " v{version}={count}");
    }
    let _ = writeln!(out);
    for result in &report.results {
        let _ = writeln!(
            out,
            "{} v{} -> v{}: {}",
            result.path.display(),
            result.old_version,
            result.new_version,
            result.error.as_deref().unwrap_or("ok")
        );
    }
    out
}

fn render_csv(report: &RewrapReport) -> String {
    let mut out = String::from("path,old_version,new_version,backed_up,error\n");
    for result in &report.results {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            result.path.display(),
            result.old_version,
            result.new_version,
            result.backed_up,
            result.error.as_deref().unwrap_or("")
        );
    }
    out
}
