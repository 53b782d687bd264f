//! Service mode: wires [`Watcher`], [`PersistentQueue`] and [`Processor`]
//! into a long-running daemon, the `watch` sub-command's target (spec.md
//! §4.10/§6). One watcher thread per configured root — an encrypt root, a
//! decrypt root, or both — feeding a single shared queue drained by one
//! processor thread, the same one-thread-per-responsibility shape the
//! follower daemon uses for its listen/apply loops.
//!
//! Shutdown and config reload go through `signal-hook`'s flag registration
//! (SIGTERM/SIGINT set `keep_running` false and fire the shared
//! [`CancelToken`]; SIGHUP re-reads the `--config` file into the processor's
//! `RwLock<VaultCryptConfig>`), polled from the main thread alongside the
//! worker threads it joins on the way out.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

use crate::cancel::CancelToken;
use crate::config::VaultCryptConfig;
use crate::crypto::{health_with_retry, VaultTransitClient};
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::queue::PersistentQueue;
use crate::stability::StabilityDetector;
use crate::watcher::{Mode, Watcher};

const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// Run service mode until a shutdown signal arrives. Blocks the calling
/// thread for the lifetime of the daemon.
pub fn run(config_path: &Path) -> Result<()> {
    let config = VaultCryptConfig::from_env().load_file(config_path)?;
    if config.watch_dir.is_none() && config.decrypt_dir.is_none() {
        return Err(Error::Config(
            "service mode needs at least one of watch_dir or decrypt_dir configured".into(),
        ));
    }

    let kms = build_kms(&config)?;
    let cancel = CancelToken::new();
    health_with_retry(&kms, 5, Duration::from_secs(1), Duration::from_secs(30), &cancel)?;

    crate::util::ensure_dir(&config.state_dir)?;
    let queue = PersistentQueue::open(
        config.queue_state_path(),
        config.max_retries,
        config.base_delay,
        config.max_delay,
    )?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let shared_config = Arc::new(RwLock::new(config.clone()));

    let term_requested = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&term_requested))
        .map_err(|e| Error::Config(format!("registering SIGTERM handler: {e}")))?;
    flag::register(SIGINT, Arc::clone(&term_requested))
        .map_err(|e| Error::Config(format!("registering SIGINT handler: {e}")))?;
    let reload_requested = Arc::new(AtomicBool::new(false));
    flag::register(SIGHUP, Arc::clone(&reload_requested))
        .map_err(|e| Error::Config(format!("registering SIGHUP handler: {e}")))?;

    std::thread::scope(|scope| {
        let mut watcher_handles = Vec::new();

        if let Some(root) = config.watch_dir.clone() {
            let watcher = Watcher::new(
                root.clone(),
                root,
                Mode::Encrypt,
                config.poll_interval,
                StabilityDetector::new(config.stability_window, config.stability_deadline),
            );
            let queue = &queue;
            let cancel = cancel.clone();
            watcher_handles.push(scope.spawn(move || {
                if let Err(e) = watcher.run(queue, &cancel) {
                    log::error!("service: encrypt watcher exited: {e}");
                }
            }));
        }

        if let Some(root) = config.decrypt_dir.clone() {
            let dest_root = config.output_dir.clone().unwrap_or_else(|| root.clone());
            let watcher = Watcher::new(
                root,
                dest_root,
                Mode::Decrypt,
                config.poll_interval,
                StabilityDetector::new(config.stability_window, config.stability_deadline),
            );
            let queue = &queue;
            let cancel = cancel.clone();
            watcher_handles.push(scope.spawn(move || {
                if let Err(e) = watcher.run(queue, &cancel) {
                    log::error!("service: decrypt watcher exited: {e}");
                }
            }));
        }

        let processor = Processor::new(kms.as_ref(), &queue, shared_config.as_ref(), keep_running.as_ref());
        let processor_cancel = cancel.clone();
        let processor_handle = scope.spawn(move || processor.run(&processor_cancel));

        run_signal_loop(
            config_path,
            shared_config.as_ref(),
            keep_running.as_ref(),
            &cancel,
            term_requested.as_ref(),
            reload_requested.as_ref(),
        );

        for handle in watcher_handles {
            let _ = handle.join();
        }
        let _ = processor_handle.join();
    });

    log::info!("service: shut down cleanly");
    Ok(())
}

/// Poll the flags `signal-hook` sets from the signal handler context (which
/// cannot safely do anything beyond storing a bool) and translate them into
/// this crate's own shutdown/reload primitives.
fn run_signal_loop(
    config_path: &Path,
    shared_config: &RwLock<VaultCryptConfig>,
    keep_running: &AtomicBool,
    cancel: &CancelToken,
    term_requested: &AtomicBool,
    reload_requested: &AtomicBool,
) {
    loop {
        if term_requested.load(Ordering::SeqCst) {
            log::info!("service: shutdown signal received, draining in-flight work");
            keep_running.store(false, Ordering::SeqCst);
            cancel.cancel();
            return;
        }
        if reload_requested.swap(false, Ordering::SeqCst) {
            reload_config(config_path, shared_config);
        }
        if cancel.sleep(SIGNAL_POLL) {
            return;
        }
    }
}

fn reload_config(config_path: &Path, shared_config: &RwLock<VaultCryptConfig>) {
    log::info!("service: SIGHUP received, reloading {}", config_path.display());
    match VaultCryptConfig::from_env().load_file(config_path) {
        Ok(fresh) => {
            *shared_config.write().unwrap() = fresh;
            log::info!("service: configuration reloaded");
        }
        Err(e) => log::error!("service: config reload failed, keeping previous configuration: {e}"),
    }
}

fn build_kms(cfg: &VaultCryptConfig) -> Result<Box<VaultTransitClient>> {
    let endpoint = cfg
        .kms_endpoint
        .clone()
        .ok_or_else(|| Error::Config("VAULTCRYPT_KMS_ENDPOINT is not set".into()))?;
    let token = cfg
        .kms_token
        .clone()
        .ok_or_else(|| Error::Config("VAULTCRYPT_KMS_TOKEN is not set".into()))?;
    Ok(Box::new(VaultTransitClient::new(endpoint, token, cfg.kms_key_name.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_rejects_config_with_no_watched_roots() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("vaultcrypt.toml");
        std::fs::write(&config_path, "kms_key_name = \"test\"\n").unwrap();
        let err = run(&config_path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
