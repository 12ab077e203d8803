// Host system queries: default shell, WSL path translation, port owners
//
// Everything that shells out to an external tool degrades to a sensible
// fallback; only `free_port_kill_process` reports failures to the caller.

use super::error::{PtyHostError, Result};
use super::paths::{escape_non_windows_path, ShellDialect};
use super::protocol::{OperatingSystem, WslPathDirection};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;

/// First build where `wsl.exe -e wslpath` is available
const MIN_WSLPATH_BUILD: u32 = 17063;
/// First build that ships `wsl.exe` rather than only `bash.exe`
const MIN_WSL_EXE_BUILD: u32 = 16299;

static CAPTURE_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+(\d+)(?:\s+|$)").expect("valid pid regex"));

static WINDOWS_BUILD: Lazy<u32> = Lazy::new(detect_windows_build_number);

/// Windows build number of the host, or 0 elsewhere
pub fn windows_build_number() -> u32 {
    *WINDOWS_BUILD
}

#[cfg(windows)]
fn detect_windows_build_number() -> u32 {
    static VERSION: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("valid version regex"));
    let output = match std::process::Command::new("cmd").args(["/c", "ver"]).output() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("Failed to query Windows version: {}", e);
            return 0;
        }
    };
    let text = String::from_utf8_lossy(&output.stdout);
    VERSION
        .captures(&text)
        .and_then(|caps| caps.get(3))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

#[cfg(not(windows))]
fn detect_windows_build_number() -> u32 {
    0
}

/// The shell a new terminal gets when the client did not pick one
pub fn default_system_shell(os: OperatingSystem, env: &HashMap<String, String>) -> String {
    match os {
        OperatingSystem::Windows => {
            let system_root = env
                .get("SystemRoot")
                .or_else(|| env.get("windir"))
                .map(String::as_str)
                .unwrap_or(r"C:\Windows");
            format!(r"{}\System32\WindowsPowerShell\v1.0\powershell.exe", system_root)
        }
        _ => env
            .get("SHELL")
            .filter(|shell| !shell.is_empty() && shell.as_str() != "/bin/false")
            .cloned()
            .unwrap_or_else(|| "/bin/sh".to_string()),
    }
}

fn wsl_executable(env: &HashMap<String, String>) -> Option<PathBuf> {
    let system_root = env.get("SystemRoot")?;
    let dir = if env.contains_key("PROCESSOR_ARCHITEW6432") {
        "Sysnative"
    } else {
        "System32"
    };
    let exe = if windows_build_number() >= MIN_WSL_EXE_BUILD {
        "wsl.exe"
    } else {
        "bash.exe"
    };
    Some(PathBuf::from(system_root).join(dir).join(exe))
}

async fn run_wslpath(executable: PathBuf, args: &[&str], original: &str) -> Option<String> {
    let output = Command::new(executable)
        .arg("-e")
        .arg("wslpath")
        .args(args)
        .arg(original)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| tracing::debug!("wslpath failed to run: {}", e))
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Translate a path between the Windows host and its WSL distro.
///
/// Falls back to `original` whenever translation is impossible or fails.
pub async fn get_wsl_path(original: &str, direction: WslPathDirection) -> String {
    if OperatingSystem::current() != OperatingSystem::Windows {
        return original.to_string();
    }
    let env: HashMap<String, String> = std::env::vars().collect();
    let build = windows_build_number();

    match direction {
        WslPathDirection::WinToUnix => {
            if build < MIN_WSLPATH_BUILD {
                return original.replace('\\', "/");
            }
            let Some(exe) = wsl_executable(&env) else {
                return original.to_string();
            };
            match run_wslpath(exe, &[], original).await {
                Some(path) => escape_non_windows_path(&path, ShellDialect::Bash),
                None => original.to_string(),
            }
        }
        WslPathDirection::UnixToWin => {
            if build < MIN_WSLPATH_BUILD {
                return original.to_string();
            }
            let Some(exe) = wsl_executable(&env) else {
                return original.to_string();
            };
            run_wslpath(exe, &["-w"], original)
                .await
                .unwrap_or_else(|| original.to_string())
        }
    }
}

/// Pull the owning pid out of a socket listing for `port`
fn find_pid_for_port(listing: &str, port: &str) -> std::result::Result<String, PtyHostError> {
    let first = listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .find(|line| line.contains(port))
        .ok_or_else(|| PtyHostError::FreePort(format!("Could not kill process with port {}", port)))?;

    CAPTURE_PID
        .captures(first)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| PtyHostError::FreePort(format!("Processes for port {} were not found", port)))
}

async fn list_listening_sockets() -> Result<String> {
    let output = if cfg!(windows) {
        Command::new("netstat").arg("-ano").output().await
    } else {
        Command::new("lsof")
            .args(["-nP", "-iTCP", "-sTCP:LISTEN"])
            .output()
            .await
    };
    let output = output.map_err(|e| {
        tracing::warn!("Failed to list listening sockets: {}", e);
        PtyHostError::FreePort("Problem occurred when listing active processes".to_string())
    })?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn kill_pid(pid: &str) {
    let Ok(pid) = pid.parse::<i32>() else {
        return;
    };
    #[cfg(unix)]
    {
        // The process may already be gone; that is not an error here
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output();
    }
}

/// Kill whichever process listens on `port`, returning `(port, pid)`
pub async fn free_port_kill_process(port: &str) -> Result<(String, String)> {
    let listing = list_listening_sockets().await?;
    let pid = find_pid_for_port(&listing, port)?;
    tracing::info!("Killing process {} listening on port {}", pid, port);
    kill_pid(&pid);
    Ok((port.to_string(), pid))
}
