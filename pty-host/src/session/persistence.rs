// Persistence of serialized terminal state
// Snapshots are saved to {state_dir}/terminal-state.json with file locking so
// a host restart can hand them back to clients for revival.

use super::config::Config;
use super::error::{PtyHostError, Result as HostResult};
use super::protocol::{SerializedTerminalState, TerminalStateDocument, TERMINAL_STATE_VERSION};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Wrap snapshots in the versioned document clients exchange with the host
pub fn serialize_terminal_state(state: Vec<SerializedTerminalState>) -> HostResult<String> {
    let document = TerminalStateDocument {
        version: TERMINAL_STATE_VERSION,
        state,
    };
    Ok(serde_json::to_string(&document)?)
}

/// Parse a document produced by `serialize_terminal_state`.
///
/// The version is checked before the body so documents from other versions
/// are reported as such rather than as shape errors.
pub fn parse_terminal_state(document: &str) -> HostResult<Vec<SerializedTerminalState>> {
    let value: serde_json::Value = serde_json::from_str(document)?;
    match value.get("version").and_then(|v| v.as_u64()) {
        Some(version) if version == u64::from(TERMINAL_STATE_VERSION) => {}
        Some(version) => {
            return Err(PtyHostError::InvalidState(format!(
                "unsupported version {} (expected {})",
                version, TERMINAL_STATE_VERSION
            )))
        }
        None => return Err(PtyHostError::InvalidState("missing version".to_string())),
    }
    let document: TerminalStateDocument = serde_json::from_value(value)?;
    Ok(document.state)
}

/// The saved-state file plus the lock file guarding it
#[derive(Debug, Clone)]
pub struct TerminalStateStore {
    path: PathBuf,
}

impl TerminalStateStore {
    pub fn new(config: &Config) -> Self {
        Self::at(config.terminal_state_file())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File> {
        let lock_path = self.path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))
    }

    /// Save a document, replacing any previous one
    pub fn save(&self, document: &str) -> Result<()> {
        let lock = self.lock_file()?;
        lock.lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on terminal state")?;

        atomic_write(&self.path, document)?;

        // Lock is automatically released when file is dropped
        Ok(())
    }

    /// Load the saved document, if there is one
    pub fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let lock = self.lock_file()?;
        lock.lock_shared()
            .with_context(|| "Failed to acquire shared lock on terminal state")?;

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read terminal state: {}", self.path.display()))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(contents))
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// Atomically save data to a file using write-to-temp + rename
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;

    // Create temp file in same directory to ensure same filesystem for rename
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
