//! CLI surface (spec.md §6): five sub-commands dispatched into
//! [`crate::envelope`], [`crate::rewrap`] and [`crate::service`]. Exit-code
//! policy lives here rather than in the binary's `main` so `vaultcrypt::cli`
//! is itself testable without a process boundary.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::cancel::CancelToken;
use crate::config::VaultCryptConfig;
use crate::crypto::{health_with_retry, VaultTransitClient};
use crate::envelope::{self, ChecksumOutcome};
use crate::error::{Error, Result};
use crate::rewrap::{render_report, KeyVersionInfo, ReportFormat, Rewrapper};
use crate::service;

#[derive(Parser, Debug)]
#[command(
    name = "vaultcrypt",
    version,
    about = "Envelope-encryption file service backed by a remote KMS transit engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run service mode (watch + process) until signalled.
    Watch {
        #[arg(long)]
        config: PathBuf,
    },
    /// One-shot: encrypt a single file.
    Encrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Override where the wrapped-key sidecar is written (defaults to
        /// the input's basename beside `--output`).
        #[arg(long)]
        key: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        checksum: bool,
    },
    /// One-shot: decrypt a single file.
    Decrypt {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long = "verify-checksum", default_value_t = false)]
        verify_checksum: bool,
    },
    /// Re-wrap `.key` sidecars to a newer KMS key version.
    Rewrap {
        #[arg(long = "key-file", conflicts_with = "dir")]
        key_file: Option<PathBuf>,
        #[arg(long, conflicts_with = "key_file")]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        recursive: bool,
        #[arg(long = "min-version")]
        min_version: u32,
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = true)]
        backup: bool,
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Offline inventory of `.key` sidecar versions; never calls the KMS.
    KeyVersions {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        recursive: bool,
        #[arg(long, default_value = "text")]
        format: String,
    },
}

/// Parse `std::env::args`, run the requested sub-command, and return the
/// process exit code (spec.md §6: 0 success, 1 general/partial failure, 2
/// config error / total rewrap failure, 3 KMS connectivity error).
pub fn run() -> i32 {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(e: &Error) -> i32 {
    match e {
        Error::Config(_) => 2,
        Error::Kms(_) => 3,
        _ => 1,
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Watch { config } => {
            service::run(&config)?;
            Ok(0)
        }
        Command::Encrypt { input, output, key, checksum } => exec_encrypt(&input, &output, key.as_deref(), checksum),
        Command::Decrypt { input, key, output, verify_checksum } => {
            exec_decrypt(&input, &key, &output, verify_checksum)
        }
        Command::Rewrap { key_file, dir, recursive, min_version, dry_run, backup, format } => {
            exec_rewrap(key_file.as_deref(), dir.as_deref(), recursive, min_version, dry_run, backup, &format)
        }
        Command::KeyVersions { dir, recursive, format } => exec_key_versions(&dir, recursive, &format),
    }
}

/// Build a production KMS client from environment configuration and confirm
/// it's reachable before doing any real work. Every sub-command that talks
/// to the KMS goes through this, so connectivity failures uniformly surface
/// as exit code 3.
fn build_kms(cfg: &VaultCryptConfig) -> Result<VaultTransitClient> {
    let endpoint = cfg
        .kms_endpoint
        .clone()
        .ok_or_else(|| Error::Config("VAULTCRYPT_KMS_ENDPOINT is not set".into()))?;
    let token = cfg
        .kms_token
        .clone()
        .ok_or_else(|| Error::Config("VAULTCRYPT_KMS_TOKEN is not set".into()))?;
    Ok(VaultTransitClient::new(endpoint, token, cfg.kms_key_name.clone()))
}

fn exec_encrypt(input: &Path, output: &Path, key: Option<&Path>, checksum: bool) -> Result<i32> {
    let cfg = VaultCryptConfig::from_env();
    let kms = build_kms(&cfg)?;
    health_with_retry(&kms, 3, std::time::Duration::from_millis(200), std::time::Duration::from_secs(5), &CancelToken::new())?;

    if let Some(parent) = output.parent() {
        crate::util::ensure_dir(parent)?;
    }
    let codec = crate::crypto::FileCodec::new(cfg.chunk_size)?;
    envelope::encrypt_file(&kms, &codec, input, output, key, checksum, &CancelToken::new())?;
    log::info!("encrypted {} -> {}", input.display(), output.display());
    Ok(0)
}

fn exec_decrypt(input: &Path, key: &Path, output: &Path, verify_checksum: bool) -> Result<i32> {
    let cfg = VaultCryptConfig::from_env();
    let kms = build_kms(&cfg)?;
    health_with_retry(&kms, 3, std::time::Duration::from_millis(200), std::time::Duration::from_secs(5), &CancelToken::new())?;

    if let Some(parent) = output.parent() {
        crate::util::ensure_dir(parent)?;
    }
    let outcome = envelope::decrypt_file(&kms, input, key, output, verify_checksum, &CancelToken::new())?;
    log::info!("decrypted {} -> {} (checksum: {outcome:?})", input.display(), output.display());
    if outcome == ChecksumOutcome::Missing {
        log::warn!("checksum verification requested but no sidecar was found");
    }
    Ok(0)
}

fn exec_rewrap(
    key_file: Option<&Path>,
    dir: Option<&Path>,
    recursive: bool,
    min_version: u32,
    dry_run: bool,
    backup: bool,
    format: &str,
) -> Result<i32> {
    let format: ReportFormat = format.parse()?;
    let cfg = VaultCryptConfig::from_env();
    let kms = build_kms(&cfg)?;
    health_with_retry(&kms, 3, std::time::Duration::from_millis(200), std::time::Duration::from_secs(5), &CancelToken::new())?;

    let rewrapper = Rewrapper::new(&kms);
    let report = match (key_file, dir) {
        (Some(file), None) => rewrapper.run_single(file, min_version, dry_run, backup)?,
        (None, Some(dir)) => rewrapper.run(dir, recursive, min_version, dry_run, backup)?,
        _ => return Err(Error::Config("exactly one of --key-file or --dir is required".into())),
    };

    print!("{}", render_report(&report, format)?);
    Ok(report.exit_code())
}

fn exec_key_versions(dir: &Path, recursive: bool, format: &str) -> Result<i32> {
    let format: ReportFormat = format.parse()?;
    // Offline: no KMS call at all, unlike `rewrap` — just parses sidecars.
    let files = Rewrapper::scan_key_files(dir, recursive)?;
    let mut report = crate::rewrap::RewrapReport::default();
    for path in files {
        report.total += 1;
        match KeyVersionInfo::load(&path, 0) {
            Ok(info) => {
                *report.version_histogram.entry(info.version).or_insert(0) += 1;
                report.skipped += 1;
            }
            Err(e) => {
                report.failed += 1;
                report.results.push(crate::rewrap::RewrapResult {
                    path,
                    old_version: 0,
                    new_version: 0,
                    old_ciphertext: String::new(),
                    new_ciphertext: String::new(),
                    backed_up: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }
    print!("{}", render_report(&report, format)?);
    Ok(report.exit_code())
}
