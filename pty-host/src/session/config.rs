// Environment configuration for the pty host
// Handles platform-specific paths for sockets, PID files and saved terminal
// state, plus the timing knobs of the reconnect machinery.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used under XDG_RUNTIME_DIR
const RUNTIME_DIR_NAME: &str = "pty-host";
/// Directory name used under the home directory
const STATE_DIR_NAME: &str = ".pty-host";

/// Configuration for host paths
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime files (socket, PID)
    pub runtime_dir: PathBuf,
    /// Directory for durable state (terminal-state.json, logs)
    pub state_dir: PathBuf,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
}

impl Config {
    /// Lay out every path under a single directory
    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            socket_path: base.join("pty-host.sock"),
            pid_file: base.join("daemon.pid"),
            runtime_dir: base.clone(),
            state_dir: base,
        }
    }

    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        Self::paths_from(
            std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
            dirs::home_dir(),
        )
    }

    fn paths_from(xdg_runtime_dir: Option<PathBuf>, home: Option<PathBuf>) -> Self {
        let state_dir = home
            .map(|h| h.join(STATE_DIR_NAME))
            .unwrap_or_else(|| std::env::temp_dir().join(RUNTIME_DIR_NAME));

        // Only Linux has a per-user runtime dir worth using
        let runtime_dir = match xdg_runtime_dir {
            Some(dir) if cfg!(target_os = "linux") => dir.join(RUNTIME_DIR_NAME),
            _ => state_dir.clone(),
        };

        Self {
            socket_path: runtime_dir.join("pty-host.sock"),
            pid_file: runtime_dir.join("daemon.pid"),
            runtime_dir,
            state_dir,
        }
    }

    /// Create configuration from environment variables, falling back to defaults.
    /// PTY_HOST_DIR overrides both the runtime and state directories.
    pub fn from_env() -> Self {
        match std::env::var_os("PTY_HOST_DIR") {
            Some(dir) if !dir.is_empty() => Self::in_dir(dir),
            _ => Self::default_paths(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Where the host saves serialized sessions on shutdown
    pub fn terminal_state_file(&self) -> PathBuf {
        self.state_dir.join("terminal-state.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("pty-host.log")
    }

    /// Ensure both directories exist; the runtime dir is owner-only on Unix
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if a process with the stored PID is still running
    #[cfg(unix)]
    pub fn is_daemon_running(&self) -> bool {
        match self.read_pid() {
            // Signal 0 only checks that the pid exists
            Some(pid) => unsafe { libc::kill(pid as i32, 0) == 0 },
            None => false,
        }
    }

    #[cfg(not(unix))]
    pub fn is_daemon_running(&self) -> bool {
        self.socket_exists()
    }
}

fn duration_ms_from(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// How long disconnected sessions survive, and how much history they keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConstants {
    /// Grace period after a client detaches
    pub grace_time: Duration,
    /// Grace period once a reconnect is known to be unlikely
    pub short_grace_time: Duration,
    /// Scrollback lines kept by the buffer mirror
    pub scrollback: usize,
}

impl Default for ReconnectConstants {
    fn default() -> Self {
        Self {
            grace_time: Duration::from_secs(60),
            short_grace_time: Duration::from_secs(6),
            scrollback: 100,
        }
    }
}

impl ReconnectConstants {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            grace_time: duration_ms_from(&lookup, "PTY_HOST_GRACE_TIME_MS", defaults.grace_time),
            short_grace_time: duration_ms_from(
                &lookup,
                "PTY_HOST_SHORT_GRACE_TIME_MS",
                defaults.short_grace_time,
            ),
            scrollback: lookup("PTY_HOST_SCROLLBACK")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.scrollback),
        }
    }
}

/// Tunables for the pty service as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    pub reconnect: ReconnectConstants,
    /// Artificial delay added to every traced RPC call
    pub simulated_latency: Duration,
    pub heartbeat_interval: Duration,
    /// How long request-reply round trips to clients may take
    pub request_timeout: Duration,
    /// The orphan question barrier opens by itself after this long
    pub orphan_question_timeout: Duration,
    /// Replies slower than this count as "no live client"
    pub orphan_reply_threshold: Duration,
    pub data_throttle: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConstants::default(),
            simulated_latency: Duration::ZERO,
            heartbeat_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            orphan_question_timeout: Duration::from_secs(4),
            orphan_reply_threshold: Duration::from_millis(500),
            data_throttle: super::bufferer::DEFAULT_THROTTLE,
        }
    }
}

impl ServiceOptions {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            reconnect: ReconnectConstants::from_lookup(&lookup),
            simulated_latency: duration_ms_from(
                &lookup,
                "PTY_HOST_SIMULATED_LATENCY_MS",
                defaults.simulated_latency,
            ),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_from_env_override() {
        let temp_dir = TempDir::new().unwrap();
        std::env::set_var("PTY_HOST_DIR", temp_dir.path());

        let config = Config::from_env();
        assert_eq!(config.runtime_dir(), temp_dir.path());
        assert_eq!(config.state_dir(), temp_dir.path());
        assert_eq!(config.socket_path, temp_dir.path().join("pty-host.sock"));
        assert_eq!(config.pid_file, temp_dir.path().join("daemon.pid"));

        std::env::remove_var("PTY_HOST_DIR");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_paths_with_xdg() {
        let config = Config::paths_from(
            Some(PathBuf::from("/run/user/1000")),
            Some(PathBuf::from("/home/me")),
        );
        assert_eq!(config.runtime_dir(), Path::new("/run/user/1000/pty-host"));
        assert_eq!(config.state_dir(), Path::new("/home/me/.pty-host"));
        assert!(config.socket_path.starts_with(&config.runtime_dir));
    }

    #[test]
    fn test_paths_without_xdg_share_state_dir() {
        let config = Config::paths_from(None, Some(PathBuf::from("/home/me")));
        assert_eq!(config.runtime_dir(), config.state_dir());
        assert_eq!(
            config.terminal_state_file(),
            PathBuf::from("/home/me/.pty-host/terminal-state.json")
        );
    }

    #[test]
    fn test_pid_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::in_dir(temp_dir.path());

        config.write_pid().unwrap();
        assert_eq!(config.read_pid(), Some(std::process::id()));
        #[cfg(unix)]
        assert!(config.is_daemon_running());

        config.remove_pid().unwrap();
        assert!(config.read_pid().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dirs_creates_runtime_dir_with_0700() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::in_dir(temp_dir.path().join("runtime"));
        config.state_dir = temp_dir.path().join("state");

        config.ensure_dirs().unwrap();

        let mode = std::fs::metadata(&config.runtime_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700, "runtime_dir should have 0700 permissions");
        assert!(config.state_dir.exists());
    }

    #[test]
    fn test_reconnect_constants_defaults_and_overrides() {
        let defaults = ReconnectConstants::from_lookup(lookup(&[]));
        assert_eq!(defaults, ReconnectConstants::default());
        assert_eq!(defaults.grace_time, Duration::from_secs(60));
        assert_eq!(defaults.short_grace_time, Duration::from_secs(6));

        let custom = ReconnectConstants::from_lookup(lookup(&[
            ("PTY_HOST_GRACE_TIME_MS", "1500"),
            ("PTY_HOST_SCROLLBACK", "1000"),
            ("PTY_HOST_SHORT_GRACE_TIME_MS", "not a number"),
        ]));
        assert_eq!(custom.grace_time, Duration::from_millis(1500));
        assert_eq!(custom.scrollback, 1000);
        assert_eq!(custom.short_grace_time, Duration::from_secs(6));
    }

    #[test]
    fn test_service_options_latency_override() {
        let options = ServiceOptions::from_lookup(lookup(&[("PTY_HOST_SIMULATED_LATENCY_MS", "25")]));
        assert_eq!(options.simulated_latency, Duration::from_millis(25));
        assert_eq!(options.orphan_question_timeout, Duration::from_secs(4));
        assert_eq!(options.orphan_reply_threshold, Duration::from_millis(500));
    }
}
