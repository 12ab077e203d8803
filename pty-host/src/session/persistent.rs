// Persistent process - keeps a terminal alive across client disconnects
//
// Wraps a `TerminalProcess` with:
// - Interaction tracking (None -> ReplayOnly -> Session, never backwards)
// - Reconnection grace timers (long on detach, short once reconnect is unlikely)
// - Orphan questions answered by clients
// - Output buffering and a mirror used for replay and serialization

use super::bufferer::DataBufferer;
use super::config::ServiceOptions;
use super::protocol::{
    FixedDimensions, InteractionState, LaunchError, ProcessDetails, ProcessLaunchConfig,
    ProcessProperty, ProcessPropertyType, PtyHostEvent, ReplayEvent, SessionId, ShellLaunchConfig,
    TerminalIcon, TitleSource, UnicodeVersion,
};
use super::runtime::{ProcessEvent, TerminalProcess};
use super::scheduler::{AutoOpenBarrier, RunOnceScheduler};
use super::serializer::{default_engine, BufferSerializer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Construction parameters that are fixed for the life of the session
pub struct PersistentProcessInit {
    pub id: SessionId,
    pub shell_launch_config: ShellLaunchConfig,
    pub process_launch_config: ProcessLaunchConfig,
    pub cols: u16,
    pub rows: u16,
    pub unicode_version: UnicodeVersion,
    pub workspace_id: String,
    pub workspace_name: String,
    pub should_persist: bool,
    /// Text written into the mirror before any live output, set when reviving
    pub revive_buffer: Option<String>,
    /// Verbatim snapshot replayed while nothing has changed since revival
    pub raw_revive_buffer: Option<String>,
    pub icon: Option<TerminalIcon>,
    pub color: Option<String>,
    pub fixed_dimensions: Option<FixedDimensions>,
}

#[derive(Debug, Default)]
struct SessionState {
    interaction: InteractionState,
    title: Option<String>,
    title_source: TitleSource,
    icon: Option<TerminalIcon>,
    color: Option<String>,
    fixed_dimensions: Option<FixedDimensions>,
    unicode_version: UnicodeVersion,
    is_started: bool,
    pid: i64,
    cwd: String,
}

impl SessionState {
    /// Move the interaction state forward; earlier states are ignored
    fn advance(&mut self, id: SessionId, to: InteractionState, reason: &str) {
        if to > self.interaction {
            tracing::debug!(
                "Persistent process {} interaction state set to {}, reason: {}",
                id,
                to,
                reason
            );
            self.interaction = to;
        }
    }
}

struct OrphanQuestion {
    barrier: Arc<AutoOpenBarrier>,
    replied_at: Option<Instant>,
}

pub struct PersistentProcess {
    id: SessionId,
    process: Arc<dyn TerminalProcess>,
    shell_launch_config: ShellLaunchConfig,
    process_launch_config: ProcessLaunchConfig,
    workspace_id: String,
    workspace_name: String,
    should_persist: bool,
    was_revived: bool,
    events: broadcast::Sender<PtyHostEvent>,
    serializer: Arc<StdMutex<BufferSerializer>>,
    bufferer: DataBufferer,
    data_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    state: StdMutex<SessionState>,
    grace: RunOnceScheduler,
    short_grace: RunOnceScheduler,
    in_replay: AtomicBool,
    orphan_queue: tokio::sync::Mutex<()>,
    orphan_question: StdMutex<Option<OrphanQuestion>>,
    orphan_question_timeout: Duration,
    orphan_reply_threshold: Duration,
}

impl PersistentProcess {
    pub fn new(
        init: PersistentProcessInit,
        process: Arc<dyn TerminalProcess>,
        options: &ServiceOptions,
        events: broadcast::Sender<PtyHostEvent>,
    ) -> Arc<Self> {
        let id = init.id;
        let was_revived = init.revive_buffer.is_some();
        let nonce = init
            .process_launch_config
            .options
            .shell_integration
            .nonce
            .clone();
        let serializer = Arc::new(StdMutex::new(BufferSerializer::new(
            default_engine().as_ref(),
            init.cols,
            init.rows,
            options.reconnect.scrollback,
            init.unicode_version,
            init.revive_buffer.as_deref(),
            init.raw_revive_buffer.filter(|_| init.should_persist),
            nonce,
        )));

        // Recording happens on the coalesced stream, the same one clients see
        let bufferer = {
            let serializer = Arc::clone(&serializer);
            let events = events.clone();
            DataBufferer::new(Arc::new(move |id, data: String| {
                serializer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handle_data(&data);
                let _ = events.send(PtyHostEvent::ProcessData { id, data });
            }))
        };
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        bufferer.start_buffering(id, data_rx, options.data_throttle);

        let grace = {
            let process = Arc::clone(&process);
            let grace_time = options.reconnect.grace_time;
            RunOnceScheduler::new(
                grace_time,
                Arc::new(move || {
                    tracing::info!(
                        "Persistent process {}: the reconnection grace time of {:?} has expired, shutting down",
                        id,
                        grace_time
                    );
                    process.shutdown(true);
                }),
            )
        };
        let short_grace = {
            let process = Arc::clone(&process);
            let short_grace_time = options.reconnect.short_grace_time;
            RunOnceScheduler::new(
                short_grace_time,
                Arc::new(move || {
                    tracing::info!(
                        "Persistent process {}: the short reconnection grace time of {:?} has expired, shutting down",
                        id,
                        short_grace_time
                    );
                    process.shutdown(true);
                }),
            )
        };

        let this = Arc::new(Self {
            id,
            process,
            shell_launch_config: init.shell_launch_config,
            process_launch_config: init.process_launch_config,
            workspace_id: init.workspace_id,
            workspace_name: init.workspace_name,
            should_persist: init.should_persist,
            was_revived,
            events,
            serializer,
            bufferer,
            data_tx: StdMutex::new(Some(data_tx)),
            state: StdMutex::new(SessionState {
                icon: init.icon,
                color: init.color,
                fixed_dimensions: init.fixed_dimensions,
                unicode_version: init.unicode_version,
                pid: -1,
                ..Default::default()
            }),
            grace,
            short_grace,
            in_replay: AtomicBool::new(false),
            orphan_queue: tokio::sync::Mutex::new(()),
            orphan_question: StdMutex::new(None),
            orphan_question_timeout: options.orphan_question_timeout,
            orphan_reply_threshold: options.orphan_reply_threshold,
        });

        if let Some(name) = this.shell_launch_config.name.clone() {
            this.set_title(name, TitleSource::Api);
        }
        this
    }

    /// Forward the process's events until it exits.
    ///
    /// `on_exit` runs after the last buffered output has been delivered.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        on_exit: impl FnOnce(SessionId, Option<i32>) + Send + 'static,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.id;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match event {
                    ProcessEvent::Data(data) => {
                        if let Some(tx) = this.data_tx.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
                            let _ = tx.send(data);
                        }
                    }
                    ProcessEvent::Ready { pid, cwd } => {
                        {
                            let mut state = this.lock_state();
                            state.pid = pid;
                            state.cwd = cwd.clone();
                        }
                        let _ = this.events.send(PtyHostEvent::ProcessReady { id, pid, cwd });
                    }
                    ProcessEvent::Property(property) => {
                        let _ = this.events.send(PtyHostEvent::DidChangeProperty { id, property });
                    }
                    ProcessEvent::Exit(exit_code) => {
                        this.data_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                        this.bufferer.drain(id).await;
                        this.grace.cancel();
                        this.short_grace.cancel();
                        drop(this);
                        on_exit(id, exit_code);
                        return;
                    }
                }
            }
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_serializer(&self) -> std::sync::MutexGuard<'_, BufferSerializer> {
        self.serializer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn should_persist(&self) -> bool {
        self.should_persist
    }

    pub fn was_revived(&self) -> bool {
        self.was_revived
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn workspace_name(&self) -> &str {
        &self.workspace_name
    }

    pub fn shell_launch_config(&self) -> &ShellLaunchConfig {
        &self.shell_launch_config
    }

    pub fn process_launch_config(&self) -> &ProcessLaunchConfig {
        &self.process_launch_config
    }

    pub fn interaction_state(&self) -> InteractionState {
        self.lock_state().interaction
    }

    /// True once a client has seen or typed into this session
    pub fn has_written_data(&self) -> bool {
        self.interaction_state() != InteractionState::None
    }

    pub fn title(&self) -> String {
        self.lock_state()
            .title
            .clone()
            .unwrap_or_else(|| self.process.current_title())
    }

    pub fn title_source(&self) -> TitleSource {
        self.lock_state().title_source
    }

    pub fn icon(&self) -> Option<TerminalIcon> {
        self.lock_state().icon.clone()
    }

    pub fn color(&self) -> Option<String> {
        self.lock_state().color.clone()
    }

    pub fn fixed_dimensions(&self) -> Option<FixedDimensions> {
        self.lock_state().fixed_dimensions
    }

    pub fn unicode_version(&self) -> UnicodeVersion {
        self.lock_state().unicode_version
    }

    pub fn pid(&self) -> i64 {
        self.lock_state().pid
    }

    pub fn is_started(&self) -> bool {
        self.lock_state().is_started
    }

    pub fn has_child_processes(&self) -> bool {
        self.process.has_child_processes()
    }

    pub fn is_grace_scheduled(&self) -> bool {
        self.grace.is_scheduled()
    }

    pub fn is_short_grace_scheduled(&self) -> bool {
        self.short_grace.is_scheduled()
    }

    pub fn set_title(&self, title: String, source: TitleSource) {
        let mut state = self.lock_state();
        if source == TitleSource::Api {
            state.advance(self.id, InteractionState::Session, "setTitle");
            self.lock_serializer().free_raw_revive_buffer();
        }
        state.title = Some(title);
        state.title_source = source;
    }

    pub fn set_icon(&self, user_initiated: bool, icon: TerminalIcon, color: Option<String>) {
        let mut state = self.lock_state();
        let changed = state.icon.as_ref() != Some(&icon) || state.color.is_none() || state.color != color;
        if changed {
            self.lock_serializer().free_raw_revive_buffer();
            if user_initiated {
                state.advance(self.id, InteractionState::Session, "setIcon");
            }
        }
        state.icon = Some(icon);
        state.color = color;
    }

    pub fn set_unicode_version(&self, version: UnicodeVersion) {
        self.lock_state().unicode_version = version;
        self.lock_serializer().set_unicode_version(version);
    }

    pub fn set_next_command_id(&self, command_line: String, command_id: String) {
        self.lock_serializer().set_next_command_id(command_line, command_id);
    }

    pub fn attach(&self) {
        if !self.grace.is_scheduled() && !self.short_grace.is_scheduled() {
            tracing::warn!(
                "Persistent process {}: process had no disconnect runners but was an orphan",
                self.id
            );
        }
        self.grace.cancel();
        self.short_grace.cancel();
    }

    /// Keep the process for the grace period if it should persist and a
    /// client has engaged with it (or persistence is forced); otherwise end it.
    pub fn detach(&self, force_persist: bool) {
        if self.should_persist && (self.has_written_data() || force_persist) {
            self.grace.schedule();
        } else {
            self.shutdown(true);
        }
    }

    pub fn reduce_grace_time(&self) {
        if self.short_grace.is_scheduled() {
            return;
        }
        if self.grace.is_scheduled() {
            self.short_grace.schedule();
        }
    }

    /// Snapshot used when persisting across a full shutdown
    pub fn serialize_normal_buffer(&self) -> ReplayEvent {
        let restore_raw = self.interaction_state() != InteractionState::Session;
        self.lock_serializer().generate_replay_event(true, restore_raw)
    }

    pub fn refresh_property(&self, kind: ProcessPropertyType) -> serde_json::Value {
        self.process.refresh_property(kind)
    }

    pub fn update_property(&self, property: ProcessProperty) {
        if property.kind == ProcessPropertyType::FixedDimensions {
            match serde_json::from_value::<FixedDimensions>(property.value) {
                Ok(dimensions) => self.lock_state().fixed_dimensions = Some(dimensions),
                Err(e) => tracing::warn!("Ignoring malformed fixed dimensions for {}: {}", self.id, e),
            }
        }
    }

    /// Launch on first call; later calls re-announce the process to a
    /// reconnecting client and replay its buffer.
    pub fn start(&self) -> Option<LaunchError> {
        let first_start = !std::mem::replace(&mut self.lock_state().is_started, true);
        if first_start {
            if let Err(e) = self.process.start() {
                tracing::warn!("Persistent process {} failed to start: {}", self.id, e.message);
                self.lock_state().is_started = false;
                return Some(e);
            }
            if self.was_revived {
                self.trigger_replay();
            } else {
                tracing::debug!("Persistent process {} is ready", self.id);
            }
            return None;
        }

        let (pid, cwd) = {
            let state = self.lock_state();
            (state.pid, state.cwd.clone())
        };
        let _ = self.events.send(PtyHostEvent::ProcessReady { id: self.id, pid, cwd });
        let _ = self.events.send(PtyHostEvent::DidChangeProperty {
            id: self.id,
            property: ProcessProperty::new(ProcessPropertyType::Title, self.process.current_title()),
        });
        let shell_type = self
            .process
            .shell_type()
            .map(|s| serde_json::Value::from(s.to_string()))
            .unwrap_or(serde_json::Value::Null);
        let _ = self.events.send(PtyHostEvent::DidChangeProperty {
            id: self.id,
            property: ProcessProperty::new(ProcessPropertyType::ShellType, shell_type),
        });
        self.trigger_replay();
        None
    }

    pub fn shutdown(&self, immediate: bool) {
        self.process.shutdown(immediate);
    }

    pub fn input(&self, data: &str) {
        self.lock_state().advance(self.id, InteractionState::Session, "input");
        self.lock_serializer().free_raw_revive_buffer();
        if self.in_replay.load(Ordering::SeqCst) {
            return;
        }
        self.process.input(data);
    }

    pub fn process_binary(&self, data: &str) {
        self.process.process_binary(data);
    }

    pub fn send_signal(&self, signal: &str) {
        if self.in_replay.load(Ordering::SeqCst) {
            return;
        }
        self.process.send_signal(signal);
    }

    /// Output buffered at the old size is delivered before the resize
    pub fn resize(&self, cols: u16, rows: u16) {
        if self.in_replay.load(Ordering::SeqCst) {
            return;
        }
        self.bufferer.flush_buffer(self.id);
        self.lock_serializer().handle_resize(cols, rows);
        self.process.resize(cols, rows);
    }

    pub fn clear_buffer(&self) {
        self.lock_serializer().clear();
        self.process.clear_buffer();
    }

    pub fn acknowledge_data_event(&self, char_count: usize) {
        if self.in_replay.load(Ordering::SeqCst) {
            return;
        }
        self.process.acknowledge_data_event(char_count);
    }

    pub fn initial_cwd(&self) -> String {
        self.process.initial_cwd()
    }

    /// Prefer the cwd reported by shell integration over the OS view
    pub fn cwd(&self) -> String {
        if let Some(cwd) = self.lock_serializer().shell_integration_cwd() {
            return cwd.to_string();
        }
        self.process.cwd()
    }

    pub fn trigger_replay(&self) {
        self.lock_state()
            .advance(self.id, InteractionState::ReplayOnly, "triggerReplay");

        let event = self.lock_serializer().generate_replay_event(false, false);
        let data_len: usize = event.events.iter().map(|e| e.data.chars().count()).sum();
        tracing::info!(
            "Persistent process {}: replaying {} chars and {} size events",
            self.id,
            data_len,
            event.events.len()
        );

        self.in_replay.store(true, Ordering::SeqCst);
        let _ = self.events.send(PtyHostEvent::ProcessReplay { id: self.id, event });
        self.in_replay.store(false, Ordering::SeqCst);

        self.process.clear_unacknowledged_chars();
        tracing::debug!("Persistent process {} is ready", self.id);
    }

    pub fn orphan_question_reply(&self) {
        let mut question = self
            .orphan_question
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(question) = question.as_mut() {
            question.replied_at = Some(Instant::now());
            question.barrier.open();
        }
    }

    /// Whether any live client still owns this session.
    ///
    /// Checks run one at a time. A session in a grace period is orphaned
    /// outright; otherwise clients are asked and a missing or slow answer
    /// counts as orphaned.
    pub async fn is_orphaned(&self) -> bool {
        let _slot = self.orphan_queue.lock().await;

        if self.grace.is_scheduled() || self.short_grace.is_scheduled() {
            return true;
        }

        let (barrier, asked_at) = {
            let barrier = Arc::new(AutoOpenBarrier::new(self.orphan_question_timeout));
            *self
                .orphan_question
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(OrphanQuestion {
                barrier: Arc::clone(&barrier),
                replied_at: None,
            });
            (barrier, Instant::now())
        };
        let _ = self.events.send(PtyHostEvent::OrphanQuestion { id: self.id });

        barrier.wait().await;

        let replied_at = self
            .orphan_question
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .and_then(|q| q.replied_at);
        match replied_at {
            Some(replied_at) => replied_at.duration_since(asked_at) > self.orphan_reply_threshold,
            None => true,
        }
    }

    /// Metadata reported to clients. Revived sessions count as orphans
    /// without asking since nobody can own them yet.
    pub async fn details(&self, assume_orphan: bool) -> ProcessDetails {
        let is_orphan = if assume_orphan {
            true
        } else {
            self.is_orphaned().await
        };
        let options = &self.process_launch_config.options;
        let state_snapshot = {
            let state = self.lock_state();
            (
                state.pid,
                state.title_source,
                state.icon.clone(),
                state.color.clone(),
                state.fixed_dimensions,
            )
        };
        let (pid, title_source, icon, color, fixed_dimensions) = state_snapshot;
        ProcessDetails {
            id: self.id,
            pid,
            title: self.title(),
            title_source,
            cwd: self.cwd(),
            workspace_id: self.workspace_id.clone(),
            workspace_name: self.workspace_name.clone(),
            is_orphan,
            icon,
            color,
            fixed_dimensions,
            environment_variable_collections: options.environment_variable_collections.clone(),
            reconnection_properties: self.shell_launch_config.reconnection_properties.clone(),
            wait_on_exit: self.shell_launch_config.wait_on_exit,
            hide_from_user: self.shell_launch_config.hide_from_user,
            is_feature_terminal: self.shell_launch_config.is_feature_terminal,
            terminal_type: self.shell_launch_config.terminal_type.clone(),
            has_child_processes: self.has_child_processes(),
            shell_integration_nonce: options.shell_integration.nonce.clone().unwrap_or_default(),
        }
    }
}

impl Drop for PersistentProcess {
    fn drop(&mut self) {
        self.grace.cancel();
        self.short_grace.cancel();
        self.bufferer.dispose();
    }
}
