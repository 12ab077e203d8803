use super::polling::{wait_for_path, WaitError};
use pty_host_lib::session::config::Config;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// RAII wrapper that ensures the daemon process is cleaned up.
pub struct DaemonGuard {
    child: Child,
    config: Config,
}

impl DaemonGuard {
    /// Start the compiled daemon with all of its files under `data_dir`.
    pub fn start(data_dir: &Path) -> Result<Self, DaemonError> {
        let daemon_bin = find_daemon_binary().ok_or(DaemonError::BinaryNotFound)?;

        let child = Command::new(&daemon_bin)
            .env("PTY_HOST_DIR", data_dir)
            .env("PTY_HOST_LOG", "debug")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(DaemonError::SpawnFailed)?;

        let guard = Self {
            child,
            config: Config::in_dir(data_dir),
        };

        println!(
            "Started pty-host-daemon (pid {}) in {}",
            guard.pid(),
            data_dir.display()
        );

        wait_for_path(&guard.config.socket_path, READY_TIMEOUT).map_err(DaemonError::ReadyTimeout)?;

        Ok(guard)
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wait for the daemon to exit on its own, e.g. after `shutdown_host`.
    pub fn wait_for_exit(&mut self) -> bool {
        super::polling::poll_until("daemon exit", EXIT_TIMEOUT, || match self.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err("still running".to_string()),
            Err(e) => Err(e.to_string()),
        })
        .is_ok()
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }

        if let Err(err) = self.child.kill() {
            eprintln!(
                "Failed to terminate pty-host-daemon pid {}: {}",
                self.child.id(),
                err
            );
            return;
        }

        let _ = self.child.wait();
    }
}

/// Start the daemon and return a guard that will clean it up on drop.
pub fn start_daemon(data_dir: &Path) -> Result<DaemonGuard, DaemonError> {
    DaemonGuard::start(data_dir)
}

fn find_daemon_binary() -> Option<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));

    [
        "../target/debug/pty-host-daemon",
        "../target/release/pty-host-daemon",
        "target/debug/pty-host-daemon",
    ]
    .iter()
    .map(|relative| manifest_dir.join(relative))
    .find(|path| path.exists())
}

/// Errors that can occur when starting the daemon for tests.
#[derive(Debug)]
pub enum DaemonError {
    BinaryNotFound,
    SpawnFailed(std::io::Error),
    ReadyTimeout(WaitError),
}

impl DaemonError {
    pub fn is_missing_binary(&self) -> bool {
        matches!(self, Self::BinaryNotFound)
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BinaryNotFound => write!(
                f,
                "pty-host-daemon binary not found. Run `cargo build` before executing integration tests."
            ),
            Self::SpawnFailed(err) => write!(f, "failed to spawn daemon: {}", err),
            Self::ReadyTimeout(err) => write!(f, "daemon never became ready: {}", err),
        }
    }
}

impl std::error::Error for DaemonError {}
