use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_DELAY_MS: u64 = 20;
const MAX_DELAY_MS: u64 = 500;

/// Error returned when a polled condition never held.
#[derive(Debug)]
pub struct WaitError {
    what: String,
    attempts: u32,
    waited: Duration,
    last_observation: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {} attempts over {:?} waiting for {}. Last observation: {}",
            self.attempts,
            self.waited,
            self.what,
            self.last_observation
                .as_deref()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or("<none>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll `check` with exponential backoff until it yields a value or `timeout`
/// passes. `Err` observations are kept for the timeout message.
pub fn poll_until<T, F>(what: &str, timeout: Duration, mut check: F) -> Result<T, WaitError>
where
    F: FnMut() -> Result<T, String>,
{
    let start = Instant::now();
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempts = 0;
    let mut last_observation = None;

    loop {
        attempts += 1;
        match check() {
            Ok(value) => return Ok(value),
            Err(observation) => last_observation = Some(observation),
        }

        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(delay.min(remaining));
        delay = (delay * 2).min(Duration::from_millis(MAX_DELAY_MS));
    }

    Err(WaitError {
        what: what.to_string(),
        attempts,
        waited: start.elapsed(),
        last_observation,
    })
}

/// Poll a file until its content satisfies `predicate`.
pub fn wait_for_file_content<P, F>(
    path: P,
    predicate: F,
    timeout: Duration,
) -> Result<String, WaitError>
where
    P: AsRef<Path>,
    F: Fn(&str) -> bool,
{
    let path = path.as_ref();
    poll_until(&path.display().to_string(), timeout, || {
        match fs::read_to_string(path) {
            Ok(content) if predicate(&content) => Ok(content),
            Ok(content) => Err(content),
            Err(err) if err.kind() == ErrorKind::NotFound => Err("file not created".to_string()),
            Err(err) => Err(err.to_string()),
        }
    })
}

/// Wait until `path` exists, e.g. a socket the daemon binds.
pub fn wait_for_path(path: &Path, timeout: Duration) -> Result<PathBuf, WaitError> {
    poll_until(&path.display().to_string(), timeout, || {
        if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err("path does not exist".to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn wait_for_file_content_returns_existing_content() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("value.txt");
        fs::write(&file, "ready").unwrap();

        let content =
            wait_for_file_content(&file, |text| text.contains("ready"), Duration::from_secs(1))
                .expect("should read file immediately");
        assert_eq!(content, "ready");
    }

    #[test]
    fn wait_for_file_content_times_out_with_context() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("missing.txt");

        let err = wait_for_file_content(
            &file,
            |text| text.contains("anything"),
            Duration::from_millis(1),
        )
        .expect_err("should time out");
        assert!(
            err.to_string().contains("missing.txt"),
            "error message should reference file path"
        );
    }

    #[test]
    fn poll_until_counts_attempts() {
        let mut calls = 0;
        let value = poll_until("third call", Duration::from_secs(2), || {
            calls += 1;
            if calls == 3 {
                Ok(calls)
            } else {
                Err(format!("call {}", calls))
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }
}
