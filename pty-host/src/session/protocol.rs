// Pty host protocol - data model shared with clients plus the RPC envelope
// Uses framed JSON messages over Unix sockets

use super::command_detection::SerializedCommandDetection;
use super::environment::EnvironmentVariableCollection;
use super::layout::{SetTerminalLayoutInfoArgs, TerminalsLayoutInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique session identifier, allocated by the service and never reused
pub type SessionId = u64;

/// Maximum size of a single request frame (revive payloads carry whole buffers)
pub const MAX_REQUEST_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Version stamped into persisted terminal state documents
pub const TERMINAL_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingSystem {
    Linux,
    Macintosh,
    Windows,
}

impl OperatingSystem {
    pub fn current() -> Self {
        if cfg!(windows) {
            OperatingSystem::Windows
        } else if cfg!(target_os = "macos") {
            OperatingSystem::Macintosh
        } else {
            OperatingSystem::Linux
        }
    }
}

/// Where the current title came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TitleSource {
    #[default]
    Process,
    Api,
}

/// How far a client has engaged with a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InteractionState {
    #[default]
    None,
    ReplayOnly,
    Session,
}

impl std::fmt::Display for InteractionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionState::None => write!(f, "None"),
            InteractionState::ReplayOnly => write!(f, "ReplayOnly"),
            InteractionState::Session => write!(f, "Session"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalIcon {
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedDimensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnicodeVersion {
    #[serde(rename = "6")]
    V6,
    #[default]
    #[serde(rename = "11")]
    V11,
}

/// What the client asked to launch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellLaunchConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// A `null` value removes the variable from the inherited environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, Option<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<TerminalIcon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Set by clients reattaching to an existing pty; never valid for creation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_persistent_process: Option<SessionId>,
    pub is_feature_terminal: bool,
    pub force_shell_integration: bool,
    pub ignore_shell_integration: bool,
    pub shell_integration_environment_reporting: bool,
    pub hide_from_user: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_on_exit: Option<bool>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub terminal_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_dimensions: Option<FixedDimensions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnection_properties: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellIntegrationConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub suggest_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminalProcessOptions {
    pub shell_integration: ShellIntegrationConfig,
    pub windows_enable_conpty: bool,
    pub windows_use_conpty_dll: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_variable_collections: Option<Vec<EnvironmentVariableCollection>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_folder: Option<String>,
    pub is_screen_reader_optimized: bool,
}

/// Everything besides the shell launch config needed to spawn an equivalent process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessLaunchConfig {
    pub env: HashMap<String, String>,
    pub executable_env: HashMap<String, String>,
    pub options: TerminalProcessOptions,
}

/// Snapshot of a session's metadata as reported to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetails {
    pub id: SessionId,
    pub pid: i64,
    pub title: String,
    pub title_source: TitleSource,
    pub cwd: String,
    pub workspace_id: String,
    pub workspace_name: String,
    pub is_orphan: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<TerminalIcon>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_dimensions: Option<FixedDimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variable_collections: Option<Vec<EnvironmentVariableCollection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnection_properties: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_on_exit: Option<bool>,
    #[serde(default)]
    pub hide_from_user: bool,
    #[serde(default)]
    pub is_feature_terminal: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub terminal_type: Option<String>,
    #[serde(default)]
    pub has_child_processes: bool,
    #[serde(default)]
    pub shell_integration_nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub cols: u16,
    pub rows: u16,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEvent {
    pub events: Vec<ReplayEntry>,
    pub commands: SerializedCommandDetection,
}

/// Self-contained snapshot of one session, enough to revive it after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTerminalState {
    pub id: SessionId,
    pub shell_launch_config: ShellLaunchConfig,
    pub process_details: ProcessDetails,
    pub process_launch_config: ProcessLaunchConfig,
    pub unicode_version: UnicodeVersion,
    pub replay_event: ReplayEvent,
    /// Epoch milliseconds
    pub timestamp: i64,
}

/// The persisted document: `{version: 1, state: [...]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalStateDocument {
    pub version: u32,
    pub state: Vec<SerializedTerminalState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessPropertyType {
    Cwd,
    InitialCwd,
    FixedDimensions,
    Title,
    ShellType,
    HasChildProcesses,
    ResolvedShellLaunchConfig,
    OverrideDimensions,
    FailedShellIntegrationActivation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessProperty {
    #[serde(rename = "type")]
    pub kind: ProcessPropertyType,
    pub value: serde_json::Value,
}

impl ProcessProperty {
    pub fn new(kind: ProcessPropertyType, value: impl Into<serde_json::Value>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Reported back to the client when a process fails to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WslPathDirection {
    WinToUnix,
    UnixToWin,
}

/// Events pushed from the host to subscribed clients, all keyed by session id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyHostEvent {
    Heartbeat {
        beat: u64,
    },
    ProcessData {
        id: SessionId,
        data: String,
    },
    ProcessReplay {
        id: SessionId,
        event: ReplayEvent,
    },
    ProcessReady {
        id: SessionId,
        pid: i64,
        cwd: String,
    },
    ProcessExit {
        id: SessionId,
        exit_code: Option<i32>,
    },
    OrphanQuestion {
        id: SessionId,
    },
    DidRequestDetach {
        request_id: u64,
        workspace_id: String,
        instance_id: SessionId,
    },
    DidChangeProperty {
        id: SessionId,
        property: ProcessProperty,
    },
}

/// Arguments of `create_process`, bundled so the RPC layer can carry them as one value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateProcessArgs {
    pub shell_launch_config: ShellLaunchConfig,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub unicode_version: UnicodeVersion,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub executable_env: HashMap<String, String>,
    #[serde(default)]
    pub options: TerminalProcessOptions,
    #[serde(default)]
    pub should_persist: bool,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub workspace_name: String,
}

/// Requests from client to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyRequest {
    /// Start forwarding host events on this connection
    Subscribe,
    CreateProcess(CreateProcessArgs),
    AttachToProcess {
        id: SessionId,
    },
    DetachFromProcess {
        id: SessionId,
        #[serde(default)]
        force_persist: bool,
    },
    Start {
        id: SessionId,
    },
    Shutdown {
        id: SessionId,
        #[serde(default)]
        immediate: bool,
    },
    Input {
        id: SessionId,
        data: String,
    },
    ProcessBinary {
        id: SessionId,
        data: String,
    },
    Resize {
        id: SessionId,
        cols: u16,
        rows: u16,
    },
    ClearBuffer {
        id: SessionId,
    },
    GetCwd {
        id: SessionId,
    },
    GetInitialCwd {
        id: SessionId,
    },
    SetTitle {
        id: SessionId,
        title: String,
        title_source: TitleSource,
    },
    SetIcon {
        id: SessionId,
        user_initiated: bool,
        icon: TerminalIcon,
        #[serde(default)]
        color: Option<String>,
    },
    SendSignal {
        id: SessionId,
        signal: String,
    },
    AcknowledgeDataEvent {
        id: SessionId,
        char_count: usize,
    },
    SetUnicodeVersion {
        id: SessionId,
        version: UnicodeVersion,
    },
    SetNextCommandId {
        id: SessionId,
        command_line: String,
        command_id: String,
    },
    RefreshProperty {
        id: SessionId,
        property: ProcessPropertyType,
    },
    UpdateProperty {
        id: SessionId,
        property: ProcessProperty,
    },
    OrphanQuestionReply {
        id: SessionId,
    },
    ListProcesses,
    ReduceConnectionGraceTime,
    SerializeTerminalState {
        ids: Vec<SessionId>,
    },
    ReviveTerminalProcesses {
        workspace_id: String,
        state: Vec<SerializedTerminalState>,
        #[serde(default)]
        locale: String,
    },
    GetRevivedPtyNewId {
        workspace_id: String,
        id: SessionId,
    },
    SetTerminalLayoutInfo(SetTerminalLayoutInfoArgs),
    GetTerminalLayoutInfo {
        workspace_id: String,
    },
    RequestDetachInstance {
        workspace_id: String,
        instance_id: SessionId,
    },
    /// Answer to `did_request_detach`: the instance's session, if it has one
    AcceptDetachInstanceReply {
        request_id: u64,
        #[serde(default)]
        persistent_process_id: Option<SessionId>,
    },
    FreePortKillProcess {
        port: String,
    },
    GetWslPath {
        path: String,
        direction: WslPathDirection,
    },
    GetDefaultSystemShell {
        #[serde(default)]
        os: Option<OperatingSystem>,
    },
    GetEnvironment,
    GetLatency,
    GetSavedTerminalState,
    ShutdownHost,
}

impl PtyRequest {
    /// Method name used for tracing
    pub fn method(&self) -> &'static str {
        match self {
            PtyRequest::Subscribe => "subscribe",
            PtyRequest::CreateProcess(_) => "createProcess",
            PtyRequest::AttachToProcess { .. } => "attachToProcess",
            PtyRequest::DetachFromProcess { .. } => "detachFromProcess",
            PtyRequest::Start { .. } => "start",
            PtyRequest::Shutdown { .. } => "shutdown",
            PtyRequest::Input { .. } => "input",
            PtyRequest::ProcessBinary { .. } => "processBinary",
            PtyRequest::Resize { .. } => "resize",
            PtyRequest::ClearBuffer { .. } => "clearBuffer",
            PtyRequest::GetCwd { .. } => "getCwd",
            PtyRequest::GetInitialCwd { .. } => "getInitialCwd",
            PtyRequest::SetTitle { .. } => "setTitle",
            PtyRequest::SetIcon { .. } => "setIcon",
            PtyRequest::SendSignal { .. } => "sendSignal",
            PtyRequest::AcknowledgeDataEvent { .. } => "acknowledgeDataEvent",
            PtyRequest::SetUnicodeVersion { .. } => "setUnicodeVersion",
            PtyRequest::SetNextCommandId { .. } => "setNextCommandId",
            PtyRequest::RefreshProperty { .. } => "refreshProperty",
            PtyRequest::UpdateProperty { .. } => "updateProperty",
            PtyRequest::OrphanQuestionReply { .. } => "orphanQuestionReply",
            PtyRequest::ListProcesses => "listProcesses",
            PtyRequest::ReduceConnectionGraceTime => "reduceConnectionGraceTime",
            PtyRequest::SerializeTerminalState { .. } => "serializeTerminalState",
            PtyRequest::ReviveTerminalProcesses { .. } => "reviveTerminalProcesses",
            PtyRequest::GetRevivedPtyNewId { .. } => "getRevivedPtyNewId",
            PtyRequest::SetTerminalLayoutInfo(_) => "setTerminalLayoutInfo",
            PtyRequest::GetTerminalLayoutInfo { .. } => "getTerminalLayoutInfo",
            PtyRequest::RequestDetachInstance { .. } => "requestDetachInstance",
            PtyRequest::AcceptDetachInstanceReply { .. } => "acceptDetachInstanceReply",
            PtyRequest::FreePortKillProcess { .. } => "freePortKillProcess",
            PtyRequest::GetWslPath { .. } => "getWslPath",
            PtyRequest::GetDefaultSystemShell { .. } => "getDefaultSystemShell",
            PtyRequest::GetEnvironment => "getEnvironment",
            PtyRequest::GetLatency => "getLatency",
            PtyRequest::GetSavedTerminalState => "getSavedTerminalState",
            PtyRequest::ShutdownHost => "shutdownHost",
        }
    }
}

/// Error codes for structured error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyErrorCode {
    NotFound,
    InvalidRequest,
    Timeout,
    Internal,
}

/// Responses from host to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PtyResponse {
    Ok,
    ProcessCreated {
        id: SessionId,
    },
    Started {
        error: Option<LaunchError>,
    },
    Cwd {
        cwd: String,
    },
    Processes {
        processes: Vec<ProcessDetails>,
    },
    SerializedState {
        state: String,
    },
    RevivedId {
        new_id: Option<SessionId>,
    },
    Layout {
        layout: Option<TerminalsLayoutInfo>,
    },
    Property {
        value: serde_json::Value,
    },
    DetachedInstance {
        details: Option<ProcessDetails>,
    },
    PortFreed {
        port: String,
        process_id: String,
    },
    WslPath {
        path: String,
    },
    DefaultShell {
        shell: String,
    },
    Environment {
        env: HashMap<String, String>,
    },
    Latency {
        label: String,
        latency_ms: f64,
    },
    SavedState {
        document: Option<String>,
    },
    Error {
        code: PtyErrorCode,
        message: String,
    },
}

/// Serialize a message to JSON bytes with a trailing newline
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
