//! Test utilities for async/daemon tests
//!
//! Polling assertions with proper timeout/retry semantics, plus an in-memory
//! terminal process so the service can be exercised without spawning shells.

use crate::session::protocol::{LaunchError, ShellLaunchConfig};
use crate::session::runtime::{
    ProcessEvent, ProcessFactory, ProcessSpec, SpawnedProcess, TerminalProcess,
};
use crate::session::shell_integration::ShellType;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Assert that an async condition eventually becomes true within a timeout.
///
/// This helper retries the provided async function at the specified interval
/// until it succeeds or the timeout is reached. Elapsed time is measured on
/// the tokio clock, so it also works under `start_paused = true`.
///
/// # Arguments
///
/// * `desc` - Human-readable description of what we're waiting for (for error messages)
/// * `timeout` - Maximum time to wait before failing
/// * `interval` - Time between retry attempts
/// * `f` - Async function that returns `Result<T, E>` where `Ok(_)` means success
///
/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use pty_host_lib::test_utils::assert_eventually;
///
/// // Wait up to 3 seconds for a session to exit, checking every 100ms
/// assert_eventually(
///     "session to exit",
///     Duration::from_secs(3),
///     Duration::from_millis(100),
///     || {
///         let result = match service.get_cwd(id) {
///             Err(e) if e.is_not_found() => Ok(()),
///             Err(e) => Err(e.to_string()),
///             Ok(_) => Err("session still running".to_string()),
///         };
///         async move { result }
///     }
/// ).await;
/// # }
/// ```
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                let last_error = e.to_string();

                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, last_error
                    );
                }

                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Variant of `assert_eventually` that takes a simple boolean condition.
///
/// # Example
///
/// ```rust,ignore
/// # use std::time::Duration;
/// # async fn example() {
/// use pty_host_lib::test_utils::assert_eventually_bool;
///
/// assert_eventually_bool(
///     "replay to arrive",
///     Duration::from_secs(2),
///     Duration::from_millis(50),
///     || async { !replays.lock().unwrap().is_empty() }
/// ).await;
/// # }
/// ```
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Condition never became true",
                desc, elapsed, attempt
            );
        }

        tokio::time::sleep(interval).await;
    }
}

/// Pid every fake process reports
pub const FAKE_PID: i64 = 4242;

#[derive(Debug, Default)]
struct FakeState {
    started: usize,
    exited: bool,
    start_error: Option<LaunchError>,
    inputs: Vec<String>,
    binary: Vec<String>,
    resizes: Vec<(u16, u16)>,
    shutdowns: Vec<bool>,
    signals: Vec<String>,
    acknowledged: usize,
    unacknowledged_clears: usize,
    buffer_clears: usize,
    title: String,
}

/// In-memory `TerminalProcess` that records every call.
///
/// Output and exit are injected with `emit_data` and `emit_exit`. Shutting
/// it down reports an exit right away.
pub struct FakeProcess {
    shell_launch_config: ShellLaunchConfig,
    cwd: String,
    events: mpsc::UnboundedSender<ProcessEvent>,
    state: Mutex<FakeState>,
}

impl FakeProcess {
    pub fn new(
        shell_launch_config: ShellLaunchConfig,
        cwd: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let title = shell_launch_config
            .executable
            .clone()
            .unwrap_or_else(|| "sh".to_string());
        let process = Self {
            shell_launch_config,
            cwd: cwd.to_string(),
            events,
            state: Mutex::new(FakeState {
                title,
                ..Default::default()
            }),
        };
        (Arc::new(process), rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit_data(&self, data: &str) {
        let _ = self.events.send(ProcessEvent::Data(data.to_string()));
    }

    pub fn emit_exit(&self, code: Option<i32>) {
        let mut state = self.lock();
        if !state.exited {
            state.exited = true;
            let _ = self.events.send(ProcessEvent::Exit(code));
        }
    }

    /// Make the next `start` fail with `message`
    pub fn fail_start(&self, message: &str) {
        self.lock().start_error = Some(LaunchError {
            message: message.to_string(),
            code: None,
        });
    }

    pub fn started_count(&self) -> usize {
        self.lock().started
    }

    pub fn inputs(&self) -> Vec<String> {
        self.lock().inputs.clone()
    }

    pub fn binary_inputs(&self) -> Vec<String> {
        self.lock().binary.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.lock().resizes.clone()
    }

    pub fn shutdowns(&self) -> Vec<bool> {
        self.lock().shutdowns.clone()
    }

    pub fn signals(&self) -> Vec<String> {
        self.lock().signals.clone()
    }

    pub fn acknowledged(&self) -> usize {
        self.lock().acknowledged
    }

    pub fn unacknowledged_clears(&self) -> usize {
        self.lock().unacknowledged_clears
    }

    pub fn buffer_clears(&self) -> usize {
        self.lock().buffer_clears
    }
}

impl TerminalProcess for FakeProcess {
    fn shell_launch_config(&self) -> &ShellLaunchConfig {
        &self.shell_launch_config
    }

    fn start(&self) -> Result<(), LaunchError> {
        let mut state = self.lock();
        if let Some(error) = state.start_error.take() {
            return Err(error);
        }
        state.started += 1;
        let _ = self.events.send(ProcessEvent::Ready {
            pid: FAKE_PID,
            cwd: self.cwd.clone(),
        });
        Ok(())
    }

    fn shutdown(&self, immediate: bool) {
        self.lock().shutdowns.push(immediate);
        self.emit_exit(None);
    }

    fn input(&self, data: &str) {
        self.lock().inputs.push(data.to_string());
    }

    fn process_binary(&self, data: &str) {
        self.lock().binary.push(data.to_string());
    }

    fn resize(&self, cols: u16, rows: u16) {
        self.lock().resizes.push((cols, rows));
    }

    fn clear_buffer(&self) {
        self.lock().buffer_clears += 1;
    }

    fn send_signal(&self, signal: &str) {
        self.lock().signals.push(signal.to_string());
    }

    fn acknowledge_data_event(&self, char_count: usize) {
        self.lock().acknowledged += char_count;
    }

    fn clear_unacknowledged_chars(&self) {
        self.lock().unacknowledged_clears += 1;
    }

    fn initial_cwd(&self) -> String {
        self.cwd.clone()
    }

    fn cwd(&self) -> String {
        self.cwd.clone()
    }

    fn current_title(&self) -> String {
        self.lock().title.clone()
    }

    fn shell_type(&self) -> Option<ShellType> {
        Some(ShellType::Bash)
    }

    fn has_child_processes(&self) -> bool {
        false
    }
}

/// Factory handing out `FakeProcess`es and remembering every spec it saw
#[derive(Default)]
pub struct FakeProcessFactory {
    created: Mutex<Vec<(ProcessSpec, Arc<FakeProcess>)>>,
}

impl FakeProcessFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<FakeProcess>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, process)| Arc::clone(process))
            .collect()
    }

    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.created().pop()
    }

    pub fn last_spec(&self) -> Option<ProcessSpec> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|(spec, _)| spec.clone())
    }
}

impl ProcessFactory for FakeProcessFactory {
    fn create(&self, spec: ProcessSpec) -> SpawnedProcess {
        let (process, events) = FakeProcess::new(spec.shell_launch_config.clone(), &spec.cwd);
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((spec, Arc::clone(&process)));
        SpawnedProcess { process, events }
    }
}
