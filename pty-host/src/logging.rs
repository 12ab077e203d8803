// Tracing subscriber setup for the pty host

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Checked before RUST_LOG
pub const LOG_ENV: &str = "PTY_HOST_LOG";

fn filter_from(lookup: impl Fn(&str) -> Option<String>) -> EnvFilter {
    let directives = lookup(LOG_ENV)
        .or_else(|| lookup("RUST_LOG"))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid log filter {:?}: {}", directives, e);
        EnvFilter::new("info")
    })
}

/// Build a subscriber writing to `log_file`, or to stderr when `None`
pub fn build_subscriber(log_file: Option<File>) -> Box<dyn tracing::Subscriber + Send + Sync> {
    let env_filter = filter_from(|key| std::env::var(key).ok());
    match log_file {
        Some(file) => Box::new(
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
                .with(env_filter),
        ),
        None => Box::new(
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(env_filter),
        ),
    }
}

/// Install the global subscriber. Logs are appended to `log_file_path` if
/// it can be opened, otherwise they go to stderr.
pub fn init(log_file_path: Option<&Path>) {
    let file = log_file_path.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    if tracing::subscriber::set_global_default(build_subscriber(file)).is_err() {
        eprintln!("A global tracing subscriber was already installed");
    }
}
