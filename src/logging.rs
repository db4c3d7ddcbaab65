//! Structured logging bootstrap.
//!
//! Opt-in: the host application calls [`init`] once at startup. Console
//! output always; when a log directory is given, a daily rolling file layer
//! is added and old files are pruned first.

use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keep at most this many rolled log files.
const MAX_LOG_FILES: usize = 14;

/// Install the global tracing subscriber. Call once; later calls are no-ops
/// (the existing subscriber wins).
pub fn init(log_dir: Option<&Path>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tillsync=debug"));

    let console_layer = fmt::layer().with_target(true);

    match log_dir {
        Some(dir) => {
            prune_old_logs(dir);
            fs::create_dir_all(dir).ok();

            let file_appender = tracing_appender::rolling::daily(dir, "tillsync");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);

            if tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
                .is_ok()
            {
                // The guard flushes on drop; the subscriber lives until
                // process exit, so leak it deliberately.
                std::mem::forget(guard);
            }
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    }
}

/// Remove the oldest rolled files beyond [`MAX_LOG_FILES`].
fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("tillsync.") || name == "tillsync.log" {
                    let modified = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .unwrap_or(std::time::UNIX_EPOCH);
                    log_files.push((path, modified));
                }
            }
        }
    }

    if log_files.len() <= MAX_LOG_FILES {
        return;
    }

    // Newest first; everything past the cap goes.
    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    for (path, _) in log_files.into_iter().skip(MAX_LOG_FILES) {
        let _ = fs::remove_file(path);
    }
}
