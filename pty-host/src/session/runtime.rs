// Terminal process runtime
//
// Wraps portable-pty behind the `TerminalProcess` trait so the persistent
// layer can be driven by real ptys in the daemon and by in-memory fakes in
// tests:
// - Launch planning (executable, env, shell integration)
// - Spawning and reading output as UTF-8 text
// - Flow control against unacknowledged output
// - Signals, resize, cwd and title tracking
// - Graceful and forced termination

use super::environment::apply_collections;
use super::protocol::{
    LaunchError, OperatingSystem, ProcessProperty, ProcessPropertyType, ShellLaunchConfig,
    TerminalProcessOptions,
};
use super::shell_integration::{
    copy_injection_files, get_shell_integration_injection, InjectionContext, InjectionFailureReason,
    InjectionResult, ShellType,
};
use super::system::default_system_shell;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Pause reading once this many characters are unacknowledged
const HIGH_WATERMARK_CHARS: usize = 100_000;
/// Resume reading once acknowledgements bring the backlog below this
const LOW_WATERMARK_CHARS: usize = 5_000;

/// Time given to a non-immediate shutdown for pending output to drain
const SHUTDOWN_DRAIN_DELAY: Duration = Duration::from_millis(250);

/// How long the exit path waits for the reader to hit EOF
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Events emitted by a terminal process, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Data(String),
    Ready { pid: i64, cwd: String },
    Property(ProcessProperty),
    Exit(Option<i32>),
}

/// Everything needed to launch one process
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub shell_launch_config: ShellLaunchConfig,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub env: HashMap<String, String>,
    pub executable_env: HashMap<String, String>,
    pub options: TerminalProcessOptions,
}

/// An OS-level terminal process as seen by the persistent layer
pub trait TerminalProcess: Send + Sync {
    fn shell_launch_config(&self) -> &ShellLaunchConfig;
    /// Spawn the process. Output and lifecycle arrive as `ProcessEvent`s.
    fn start(&self) -> Result<(), LaunchError>;
    fn shutdown(&self, immediate: bool);
    fn input(&self, data: &str);
    /// Write `data` as raw bytes, one byte per char
    fn process_binary(&self, data: &str);
    fn resize(&self, cols: u16, rows: u16);
    fn clear_buffer(&self);
    fn send_signal(&self, signal: &str);
    fn acknowledge_data_event(&self, char_count: usize);
    fn clear_unacknowledged_chars(&self);
    fn initial_cwd(&self) -> String;
    fn cwd(&self) -> String;
    fn current_title(&self) -> String;
    fn shell_type(&self) -> Option<ShellType>;
    fn has_child_processes(&self) -> bool;

    fn refresh_property(&self, kind: ProcessPropertyType) -> serde_json::Value {
        match kind {
            ProcessPropertyType::Cwd => self.cwd().into(),
            ProcessPropertyType::InitialCwd => self.initial_cwd().into(),
            ProcessPropertyType::Title => self.current_title().into(),
            ProcessPropertyType::ShellType => self
                .shell_type()
                .map(|s| serde_json::Value::from(s.to_string()))
                .unwrap_or(serde_json::Value::Null),
            ProcessPropertyType::HasChildProcesses => self.has_child_processes().into(),
            _ => serde_json::Value::Null,
        }
    }
}

pub struct SpawnedProcess {
    pub process: Arc<dyn TerminalProcess>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Creates terminal processes; the service owns exactly one
pub trait ProcessFactory: Send + Sync {
    fn create(&self, spec: ProcessSpec) -> SpawnedProcess;
}

/// Tracks output the client has not acknowledged yet
#[derive(Debug, Default)]
pub struct FlowControl {
    unacknowledged: AtomicUsize,
    paused: AtomicBool,
}

impl FlowControl {
    pub fn record(&self, chars: usize) {
        let total = self.unacknowledged.fetch_add(chars, Ordering::SeqCst) + chars;
        if total > HIGH_WATERMARK_CHARS && !self.paused.swap(true, Ordering::SeqCst) {
            tracing::trace!("Flow control: pausing at {} unacknowledged chars", total);
        }
    }

    pub fn acknowledge(&self, chars: usize) {
        let previous = self
            .unacknowledged
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(chars)))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(chars);
        if remaining < LOW_WATERMARK_CHARS && self.paused.swap(false, Ordering::SeqCst) {
            tracing::trace!("Flow control: resuming at {} unacknowledged chars", remaining);
        }
    }

    pub fn clear(&self) {
        self.unacknowledged.store(0, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn unacknowledged(&self) -> usize {
        self.unacknowledged.load(Ordering::SeqCst)
    }
}

/// Turns a byte stream into text without splitting multi-byte characters
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: `valid` bytes were just validated
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Resolved launch parameters for a spec
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub executable: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub injection: InjectionResult,
}

/// Work out what to run, with which args and env.
///
/// `host_env` is used when the client did not send a full environment.
pub fn plan_launch(
    spec: &ProcessSpec,
    host_env: &HashMap<String, String>,
    ctx: &InjectionContext,
) -> Result<LaunchPlan, LaunchError> {
    let mut env = if spec.env.is_empty() {
        host_env.clone()
    } else {
        spec.env.clone()
    };

    let executable = spec
        .shell_launch_config
        .executable
        .clone()
        .unwrap_or_else(|| default_system_shell(ctx.platform, &env));

    let cwd = if spec.cwd.is_empty() {
        ctx.home_dir.clone().unwrap_or_else(|| PathBuf::from("/"))
    } else {
        PathBuf::from(&spec.cwd)
    };
    if !cwd.is_dir() {
        return Err(LaunchError {
            message: format!("Starting directory (cwd) \"{}\" does not exist", cwd.display()),
            code: None,
        });
    }

    if let Some(collections) = spec.options.environment_variable_collections.as_deref() {
        apply_collections(&mut env, collections, spec.options.workspace_folder.as_deref());
    }
    if let Some(overrides) = &spec.shell_launch_config.env {
        for (key, value) in overrides {
            match value {
                Some(value) => env.insert(key.clone(), value.clone()),
                None => env.remove(key),
            };
        }
    }
    env.extend(spec.executable_env.clone());

    let mut launch_config = spec.shell_launch_config.clone();
    launch_config.executable = Some(executable.clone());
    let injection = get_shell_integration_injection(&launch_config, &spec.options, &env, ctx);

    let args = match &injection {
        InjectionResult::Injection(injection) => {
            env.extend(injection.env_mixin.clone());
            injection.new_args.clone()
        }
        InjectionResult::Failure { nonce, .. } => {
            if let Some(nonce) = nonce {
                env.insert("VSCODE_NONCE".to_string(), nonce.clone());
            }
            launch_config.args.clone().unwrap_or_default()
        }
    };

    Ok(LaunchPlan {
        executable,
        args,
        cwd,
        env,
        injection,
    })
}

fn executable_title(executable: &str) -> String {
    executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable)
        .to_string()
}

/// Live handles of a started pty
struct Running {
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    pid: Option<u32>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

/// A terminal process backed by portable-pty
pub struct PtyProcess {
    spec: ProcessSpec,
    events: mpsc::UnboundedSender<ProcessEvent>,
    running: StdMutex<Option<Running>>,
    flow: Arc<FlowControl>,
    title: Arc<StdMutex<String>>,
    shell_type: StdMutex<Option<ShellType>>,
    initial_cwd: StdMutex<String>,
    exit_reported: AtomicBool,
}

impl PtyProcess {
    pub fn new(spec: ProcessSpec) -> SpawnedProcess {
        let (events, rx) = mpsc::unbounded_channel();
        let process = Self {
            spec,
            events,
            running: StdMutex::new(None),
            flow: Arc::new(FlowControl::default()),
            title: Arc::new(StdMutex::new(String::new())),
            shell_type: StdMutex::new(None),
            initial_cwd: StdMutex::new(String::new()),
            exit_reported: AtomicBool::new(false),
        };
        SpawnedProcess {
            process: Arc::new(process),
            events: rx,
        }
    }

    fn launch(&self) -> anyhow::Result<Result<(), LaunchError>> {
        use anyhow::Context;

        let host_env: HashMap<String, String> = std::env::vars().collect();
        let ctx = InjectionContext::from_env();
        let plan = match plan_launch(&self.spec, &host_env, &ctx) {
            Ok(plan) => plan,
            Err(launch_error) => return Ok(Err(launch_error)),
        };

        match &plan.injection {
            InjectionResult::Injection(injection) => {
                if let Err(e) = copy_injection_files(&injection.files_to_copy) {
                    tracing::error!("Shell integration files could not be copied: {:#}", e);
                }
            }
            InjectionResult::Failure { reason, .. } => {
                tracing::debug!("Shell integration not injected: {:?}", reason);
                if self.spec.options.shell_integration.enabled
                    && *reason != InjectionFailureReason::InjectionSettingDisabled
                {
                    let _ = self.events.send(ProcessEvent::Property(ProcessProperty::new(
                        ProcessPropertyType::FailedShellIntegrationActivation,
                        true,
                    )));
                }
            }
        }

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.spec.rows.max(1),
                cols: self.spec.cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;
        let portable_pty::PtyPair { master, slave } = pair;

        let mut cmd = CommandBuilder::new(&plan.executable);
        cmd.args(&plan.args);
        cmd.cwd(&plan.cwd);
        cmd.env_clear();
        for (key, value) in &plan.env {
            cmd.env(key, value);
        }

        let child = match slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => {
                return Ok(Err(LaunchError {
                    message: format!("A native exception occurred during launch ({})", e),
                    code: None,
                }))
            }
        };
        drop(slave);

        let pid = child.process_id();
        let reader = master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = master.take_writer().context("Failed to take PTY writer")?;
        let master = Arc::new(StdMutex::new(master));

        let (input_tx, input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (reader_done_tx, reader_done_rx) = std::sync::mpsc::channel::<()>();

        let fallback_title = executable_title(&plan.executable);
        *self.title.lock().unwrap_or_else(PoisonError::into_inner) = fallback_title.clone();
        let shell_type = ShellType::from_path(&plan.executable, OperatingSystem::current());
        *self.shell_type.lock().unwrap_or_else(PoisonError::into_inner) = shell_type;
        let cwd = plan.cwd.to_string_lossy().into_owned();
        *self.initial_cwd.lock().unwrap_or_else(PoisonError::into_inner) = cwd.clone();

        spawn_reader_thread(reader, self.events.clone(), Arc::clone(&self.flow), reader_done_tx);
        spawn_writer_thread(writer, input_rx);
        spawn_wait_thread(
            child,
            self.events.clone(),
            shutdown_rx,
            reader_done_rx,
            Arc::clone(&master),
            Arc::clone(&self.title),
        );

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            input_tx,
            master,
            pid,
            shutdown_tx: Some(shutdown_tx),
        });

        let _ = self.events.send(ProcessEvent::Ready {
            pid: pid.map(i64::from).unwrap_or(-1),
            cwd,
        });
        let _ = self.events.send(ProcessEvent::Property(ProcessProperty::new(
            ProcessPropertyType::Title,
            fallback_title,
        )));
        if let Some(shell_type) = shell_type {
            let _ = self.events.send(ProcessEvent::Property(ProcessProperty::new(
                ProcessPropertyType::ShellType,
                shell_type.to_string(),
            )));
        }
        Ok(Ok(()))
    }

    fn with_running<R>(&self, f: impl FnOnce(&mut Running) -> R) -> Option<R> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(f)
    }

    fn write(&self, bytes: Vec<u8>) {
        self.with_running(|running| {
            let _ = running.input_tx.send(bytes);
        });
    }

    fn pid(&self) -> Option<u32> {
        self.with_running(|running| running.pid).flatten()
    }
}

impl TerminalProcess for PtyProcess {
    fn shell_launch_config(&self) -> &ShellLaunchConfig {
        &self.spec.shell_launch_config
    }

    fn start(&self) -> Result<(), LaunchError> {
        match self.launch() {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Failed to start pty: {:#}", e);
                Err(LaunchError {
                    message: format!("{:#}", e),
                    code: None,
                })
            }
        }
    }

    fn shutdown(&self, immediate: bool) {
        let tx = match self.with_running(|running| running.shutdown_tx.take()) {
            Some(Some(tx)) => tx,
            Some(None) => return,
            None => {
                // Never started: nothing will report an exit otherwise
                if !self.exit_reported.swap(true, Ordering::SeqCst) {
                    let _ = self.events.send(ProcessEvent::Exit(None));
                }
                return;
            }
        };
        if immediate {
            let _ = tx.send(());
        } else {
            std::thread::spawn(move || {
                std::thread::sleep(SHUTDOWN_DRAIN_DELAY);
                let _ = tx.send(());
            });
        }
    }

    fn input(&self, data: &str) {
        self.write(data.as_bytes().to_vec());
    }

    fn process_binary(&self, data: &str) {
        self.write(data.chars().map(|c| c as u32 as u8).collect());
    }

    fn resize(&self, cols: u16, rows: u16) {
        self.with_running(|running| {
            let master = running.master.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = master.resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            }) {
                tracing::warn!("Failed to resize pty: {}", e);
            }
        });
    }

    fn clear_buffer(&self) {
        // Unix ptys keep no buffer of their own
    }

    fn send_signal(&self, signal: &str) {
        let Some(pid) = self.pid() else {
            return;
        };
        send_signal_to_pid(pid, signal);
    }

    fn acknowledge_data_event(&self, char_count: usize) {
        self.flow.acknowledge(char_count);
    }

    fn clear_unacknowledged_chars(&self) {
        self.flow.clear();
    }

    fn initial_cwd(&self) -> String {
        let cwd = self.initial_cwd.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if cwd.is_empty() {
            self.spec.cwd.clone()
        } else {
            cwd
        }
    }

    fn cwd(&self) -> String {
        self.pid()
            .and_then(process_cwd)
            .unwrap_or_else(|| self.initial_cwd())
    }

    fn current_title(&self) -> String {
        self.title.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn shell_type(&self) -> Option<ShellType> {
        *self.shell_type.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_child_processes(&self) -> bool {
        self.pid().map(pid_has_children).unwrap_or(false)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // Dropping the shutdown sender makes the wait thread kill the child
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Spawns real ptys
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyProcessFactory;

impl ProcessFactory for PtyProcessFactory {
    fn create(&self, spec: ProcessSpec) -> SpawnedProcess {
        PtyProcess::new(spec)
    }
}

/// Read output until EOF, holding back while flow control is paused
fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    flow: Arc<FlowControl>,
    done: std::sync::mpsc::Sender<()>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        let mut decoder = Utf8Accumulator::default();
        loop {
            while flow.is_paused() && !events.is_closed() {
                std::thread::sleep(Duration::from_millis(5));
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    flow.record(text.chars().count());
                    if events.send(ProcessEvent::Data(text)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // EIO is how Linux reports the slave side closing
                    tracing::trace!("PTY read ended: {}", e);
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

fn spawn_writer_thread(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });
}

/// Wait for the child to exit (or be killed), tracking the foreground
/// process name as the title along the way. Exit is reported only after the
/// reader has drained so it always follows the last data chunk.
fn spawn_wait_thread(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    reader_done: std::sync::mpsc::Receiver<()>,
    master: Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    title: Arc<StdMutex<String>>,
) {
    std::thread::spawn(move || {
        let exit_code = loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                    let _ = child.kill();
                    break child.wait().ok().map(|status| status.exit_code() as i32);
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
            }

            match child.try_wait() {
                Ok(Some(status)) => break Some(status.exit_code() as i32),
                Ok(None) => {
                    poll_title(&master, &title, &events);
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::error!("Error waiting for child: {}", e);
                    break None;
                }
            }
        };

        let _ = reader_done.recv_timeout(READER_DRAIN_TIMEOUT);
        let _ = events.send(ProcessEvent::Exit(exit_code));
    });
}

fn poll_title(
    master: &Arc<StdMutex<Box<dyn MasterPty + Send>>>,
    title: &Arc<StdMutex<String>>,
    events: &mpsc::UnboundedSender<ProcessEvent>,
) {
    let Some(name) = foreground_process_name(master) else {
        return;
    };
    let mut current = title.lock().unwrap_or_else(PoisonError::into_inner);
    if *current != name {
        *current = name.clone();
        let _ = events.send(ProcessEvent::Property(ProcessProperty::new(
            ProcessPropertyType::Title,
            name,
        )));
    }
}

#[cfg(target_os = "linux")]
fn foreground_process_name(master: &Arc<StdMutex<Box<dyn MasterPty + Send>>>) -> Option<String> {
    let leader = master
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .process_group_leader()?;
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", leader)).ok()?;
    let name = comm.trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(not(target_os = "linux"))]
fn foreground_process_name(_master: &Arc<StdMutex<Box<dyn MasterPty + Send>>>) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn process_cwd(pid: u32) -> Option<String> {
    std::fs::read_link(format!("/proc/{}/cwd", pid))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(target_os = "macos")]
fn process_cwd(pid: u32) -> Option<String> {
    let output = std::process::Command::new("lsof")
        .args(["-a", "-d", "cwd", "-p", &pid.to_string(), "-Fn"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.strip_prefix('n').map(str::to_string))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn process_cwd(_pid: u32) -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn pid_has_children(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))
        .map(|children| !children.trim().is_empty())
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn pid_has_children(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal_to_pid(pid: u32, signal: &str) {
    let signo = match signal.trim_start_matches("SIG") {
        "INT" => libc::SIGINT,
        "TERM" => libc::SIGTERM,
        "KILL" => libc::SIGKILL,
        "HUP" => libc::SIGHUP,
        "QUIT" => libc::SIGQUIT,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "WINCH" => libc::SIGWINCH,
        "TSTP" => libc::SIGTSTP,
        "CONT" => libc::SIGCONT,
        other => {
            tracing::warn!("Unsupported signal {}", other);
            return;
        }
    };
    // The process may already be gone
    unsafe {
        libc::kill(pid as i32, signo);
    }
}

#[cfg(not(unix))]
fn send_signal_to_pid(pid: u32, signal: &str) {
    tracing::warn!("Signals are not supported on this platform ({} to {})", signal, pid);
}
