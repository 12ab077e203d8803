// Pty service - the single owner of every live session
//
// Creates processes, routes client operations to them by id, serializes
// sessions for a window reload or host restart and revives them afterwards.
// All host events go out on one broadcast channel.

use super::config::ServiceOptions;
use super::error::{PtyHostError, Result};
use super::layout::{
    reviving_process_key, ExpansionGuard, LayoutStore, SetTerminalLayoutInfoArgs,
    TerminalInstanceLayoutInfo, TerminalTabLayoutInfo, TerminalsLayoutInfo,
};
use super::persistence::serialize_terminal_state;
use super::persistent::{PersistentProcess, PersistentProcessInit};
use super::protocol::{
    CreateProcessArgs, LaunchError, OperatingSystem, ProcessDetails, ProcessLaunchConfig,
    ProcessProperty, ProcessPropertyType, PtyHostEvent, SerializedTerminalState, SessionId,
    TerminalIcon, TitleSource, UnicodeVersion, WslPathDirection,
};
use super::request_store::RequestStore;
use super::runtime::{ProcessFactory, ProcessSpec};
use super::system;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the host event channel; slow subscribers lag rather than block
const EVENT_CHANNEL_CAPACITY: usize = 4096;

type PtyMap = Arc<StdMutex<HashMap<SessionId, Arc<PersistentProcess>>>>;

/// Banner shown under revived output. Unknown locales fall back to English.
pub fn restore_message(locale: &str) -> &'static str {
    let locale = locale.trim().to_ascii_lowercase().replace('_', "-");
    let language = locale.split('-').next().unwrap_or_default();
    match (language, locale.as_str()) {
        (_, "zh-tw" | "zh-hk" | "zh-hant") => "已還原歷程記錄",
        ("zh", _) => "已还原历史记录",
        ("pt", _) => "Histórico restaurado",
        ("de", _) => "Verlauf wiederhergestellt",
        ("fr", _) => "Historique restauré",
        ("es", _) => "Historial restaurado",
        ("it", _) => "Cronologia ripristinata",
        ("ja", _) => "履歴が復元されました",
        ("ko", _) => "기록 복원됨",
        ("ru", _) => "Журнал восстановлен",
        _ => "History restored",
    }
}

/// Highlight a host-generated message so it stands out from shell output
pub fn format_message_for_terminal(message: &str) -> String {
    format!("\r\n\x1b[0m\x1b[7m * \x1b[0;104m {} \x1b[0m\n\r", message)
}

pub struct PtyService {
    options: ServiceOptions,
    factory: Arc<dyn ProcessFactory>,
    events: broadcast::Sender<PtyHostEvent>,
    last_pty_id: AtomicU64,
    ptys: PtyMap,
    /// `{workspace}-{old id}` -> new id, consumed by layout expansion
    revived_ids: StdMutex<HashMap<String, SessionId>>,
    layouts: StdMutex<LayoutStore>,
    detach_requests: RequestStore<Option<ProcessDetails>>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl PtyService {
    /// Must be called inside a tokio runtime; starts the heartbeat
    pub fn new(options: ServiceOptions, factory: Arc<dyn ProcessFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let heartbeat = {
            let events = events.clone();
            let interval = options.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately
                ticker.tick().await;
                let mut beat = 0u64;
                loop {
                    ticker.tick().await;
                    beat += 1;
                    let _ = events.send(PtyHostEvent::Heartbeat { beat });
                }
            })
        };

        Self {
            detach_requests: RequestStore::new(options.request_timeout),
            options,
            factory,
            events,
            last_pty_id: AtomicU64::new(0),
            ptys: Arc::new(StdMutex::new(HashMap::new())),
            revived_ids: StdMutex::new(HashMap::new()),
            layouts: StdMutex::new(LayoutStore::default()),
            heartbeat: StdMutex::new(Some(heartbeat)),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Receive every host event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PtyHostEvent> {
        self.events.subscribe()
    }

    fn get_pty(&self, id: SessionId) -> Result<Arc<PersistentProcess>> {
        self.ptys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(PtyHostError::NotFound(id))
    }

    fn all_ptys(&self) -> Vec<Arc<PersistentProcess>> {
        self.ptys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn process_count(&self) -> usize {
        self.ptys.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn create_process(&self, args: CreateProcessArgs) -> Result<SessionId> {
        self.create_process_inner(args, false, None)
    }

    fn create_process_inner(
        &self,
        args: CreateProcessArgs,
        is_reviving: bool,
        raw_revive_buffer: Option<String>,
    ) -> Result<SessionId> {
        if args.shell_launch_config.attach_persistent_process.is_some() {
            return Err(PtyHostError::AttachOnCreate);
        }

        let id = self.last_pty_id.fetch_add(1, Ordering::SeqCst) + 1;
        let spawned = self.factory.create(ProcessSpec {
            shell_launch_config: args.shell_launch_config.clone(),
            cwd: args.cwd.clone(),
            cols: args.cols,
            rows: args.rows,
            env: args.env.clone(),
            executable_env: args.executable_env.clone(),
            options: args.options.clone(),
        });

        let slc = args.shell_launch_config;
        let init = PersistentProcessInit {
            id,
            revive_buffer: if is_reviving { slc.initial_text.clone() } else { None },
            raw_revive_buffer,
            icon: slc.icon.clone(),
            color: slc.color.clone(),
            fixed_dimensions: slc.fixed_dimensions,
            shell_launch_config: slc,
            process_launch_config: ProcessLaunchConfig {
                env: args.env,
                executable_env: args.executable_env,
                options: args.options,
            },
            cols: args.cols,
            rows: args.rows,
            unicode_version: args.unicode_version,
            workspace_id: args.workspace_id,
            workspace_name: args.workspace_name,
            should_persist: args.should_persist,
        };
        let persistent = PersistentProcess::new(init, spawned.process, &self.options, self.events.clone());

        self.ptys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&persistent));

        let ptys = Arc::clone(&self.ptys);
        let events = self.events.clone();
        persistent.spawn_event_pump(spawned.events, move |id, exit_code| {
            let removed = ptys.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            drop(removed);
            tracing::info!("Persistent process {} exited with {:?}", id, exit_code);
            let _ = events.send(PtyHostEvent::ProcessExit { id, exit_code });
        });

        tracing::debug!("Created persistent process {}", id);
        Ok(id)
    }

    pub fn attach_to_process(&self, id: SessionId) -> Result<()> {
        match self.get_pty(id) {
            Ok(pty) => {
                pty.attach();
                tracing::info!("Persistent process reconnection {}", id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Persistent process reconnection {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    pub fn detach_from_process(&self, id: SessionId, force_persist: bool) -> Result<()> {
        self.get_pty(id)?.detach(force_persist);
        Ok(())
    }

    pub fn reduce_connection_grace_time(&self) {
        for pty in self.all_ptys() {
            pty.reduce_grace_time();
        }
    }

    /// Persistable sessions no live client owns
    pub async fn list_processes(&self) -> Vec<ProcessDetails> {
        let all = self.all_ptys();
        let persistent: Vec<_> = all.iter().filter(|p| p.should_persist()).cloned().collect();
        tracing::info!(
            "Listing {} persistent terminals, {} total terminals",
            persistent.len(),
            all.len()
        );

        let checks: Vec<JoinHandle<ProcessDetails>> = persistent
            .into_iter()
            .map(|pty| tokio::spawn(async move { pty.details(false).await }))
            .collect();
        let mut orphans = Vec::new();
        for check in checks {
            match check.await {
                Ok(details) if details.is_orphan => orphans.push(details),
                Ok(_) => {}
                Err(e) => tracing::warn!("Orphan check failed: {}", e),
            }
        }
        orphans
    }

    /// Launch a created process, or re-announce an already running one.
    /// An unknown id is reported as a launch error rather than a failure.
    pub fn start(&self, id: SessionId) -> Option<LaunchError> {
        match self.get_pty(id) {
            Ok(pty) => pty.start(),
            Err(_) => Some(LaunchError {
                message: format!("Could not find pty with id \"{}\"", id),
                code: None,
            }),
        }
    }

    /// Already-exited sessions are ignored
    pub fn shutdown(&self, id: SessionId, immediate: bool) {
        if let Ok(pty) = self.get_pty(id) {
            pty.shutdown(immediate);
        }
    }

    pub fn shutdown_all(&self) {
        let ptys: Vec<_> = self
            .ptys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pty)| pty)
            .collect();
        tracing::info!("Shutting down {} persistent processes", ptys.len());
        for pty in ptys {
            pty.shutdown(true);
        }
    }

    pub fn input(&self, id: SessionId, data: &str) -> Result<()> {
        self.get_pty(id)?.input(data);
        Ok(())
    }

    pub fn process_binary(&self, id: SessionId, data: &str) -> Result<()> {
        self.get_pty(id)?.process_binary(data);
        Ok(())
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        self.get_pty(id)?.resize(cols, rows);
        Ok(())
    }

    pub fn clear_buffer(&self, id: SessionId) -> Result<()> {
        self.get_pty(id)?.clear_buffer();
        Ok(())
    }

    pub fn get_cwd(&self, id: SessionId) -> Result<String> {
        Ok(self.get_pty(id)?.cwd())
    }

    pub fn get_initial_cwd(&self, id: SessionId) -> Result<String> {
        Ok(self.get_pty(id)?.initial_cwd())
    }

    pub fn update_title(&self, id: SessionId, title: String, source: TitleSource) -> Result<()> {
        self.get_pty(id)?.set_title(title, source);
        Ok(())
    }

    pub fn update_icon(
        &self,
        id: SessionId,
        user_initiated: bool,
        icon: TerminalIcon,
        color: Option<String>,
    ) -> Result<()> {
        self.get_pty(id)?.set_icon(user_initiated, icon, color);
        Ok(())
    }

    pub fn send_signal(&self, id: SessionId, signal: &str) -> Result<()> {
        self.get_pty(id)?.send_signal(signal);
        Ok(())
    }

    pub fn acknowledge_data_event(&self, id: SessionId, char_count: usize) -> Result<()> {
        self.get_pty(id)?.acknowledge_data_event(char_count);
        Ok(())
    }

    pub fn set_unicode_version(&self, id: SessionId, version: UnicodeVersion) -> Result<()> {
        self.get_pty(id)?.set_unicode_version(version);
        Ok(())
    }

    pub fn set_next_command_id(&self, id: SessionId, command_line: String, command_id: String) -> Result<()> {
        self.get_pty(id)?.set_next_command_id(command_line, command_id);
        Ok(())
    }

    pub fn refresh_property(&self, id: SessionId, kind: ProcessPropertyType) -> Result<serde_json::Value> {
        Ok(self.get_pty(id)?.refresh_property(kind))
    }

    pub fn update_property(&self, id: SessionId, property: ProcessProperty) -> Result<()> {
        self.get_pty(id)?.update_property(property);
        Ok(())
    }

    pub fn orphan_question_reply(&self, id: SessionId) -> Result<()> {
        self.get_pty(id)?.orphan_question_reply();
        Ok(())
    }

    /// Snapshot the requested sessions that have been seen or used
    pub async fn serialize_terminal_state(&self, ids: &[SessionId]) -> Result<String> {
        let candidates: Vec<_> = self
            .all_ptys()
            .into_iter()
            .filter(|pty| pty.has_written_data() && ids.contains(&pty.id()))
            .collect();

        let tasks: Vec<JoinHandle<SerializedTerminalState>> = candidates
            .into_iter()
            .map(|pty| {
                tokio::spawn(async move {
                    let process_details = pty.details(false).await;
                    SerializedTerminalState {
                        id: pty.id(),
                        shell_launch_config: pty.shell_launch_config().clone(),
                        process_details,
                        process_launch_config: pty.process_launch_config().clone(),
                        unicode_version: pty.unicode_version(),
                        replay_event: pty.serialize_normal_buffer(),
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    }
                })
            })
            .collect();

        let mut state = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(snapshot) => state.push(snapshot),
                Err(e) => tracing::warn!("Failed to serialize a terminal: {}", e),
            }
        }
        state.sort_by_key(|s| s.id);
        serialize_terminal_state(state)
    }

    /// Ids of every session that would survive a host restart
    pub fn persistable_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .all_ptys()
            .iter()
            .filter(|pty| pty.should_persist())
            .map(|pty| pty.id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Spawn fresh (unstarted) processes seeded with each snapshot's output
    pub fn revive_terminal_processes(
        &self,
        workspace_id: &str,
        state: Vec<SerializedTerminalState>,
        locale: &str,
    ) -> Result<()> {
        let message = restore_message(locale);
        for terminal in state {
            self.revive_terminal_process(workspace_id, terminal, message)?;
        }
        Ok(())
    }

    fn revive_terminal_process(
        &self,
        workspace_id: &str,
        terminal: SerializedTerminalState,
        message: &str,
    ) -> Result<()> {
        let Some(first) = terminal.replay_event.events.first().cloned() else {
            tracing::warn!("Terminal {} has no replay data, not reviving", terminal.id);
            return Ok(());
        };

        let mut post_restore = String::new();
        if OperatingSystem::current() == OperatingSystem::Windows {
            if let Some(last) = terminal.replay_event.events.last() {
                post_restore.push_str(&"\r\n".repeat(usize::from(last.rows.saturating_sub(1))));
                post_restore.push_str("\x1b[H");
            }
        }

        let details = terminal.process_details;
        let mut shell_launch_config = terminal.shell_launch_config;
        shell_launch_config.cwd = Some(details.cwd.clone());
        shell_launch_config.color = details.color.clone();
        shell_launch_config.icon = details.icon.clone();
        shell_launch_config.name = match details.title_source {
            TitleSource::Api => Some(details.title.clone()),
            TitleSource::Process => None,
        };
        shell_launch_config.initial_text = Some(format!(
            "{}{}{}",
            first.data,
            format_message_for_terminal(message),
            post_restore
        ));

        let new_id = self.create_process_inner(
            CreateProcessArgs {
                shell_launch_config,
                cwd: details.cwd,
                cols: first.cols,
                rows: first.rows,
                unicode_version: terminal.unicode_version,
                env: terminal.process_launch_config.env,
                executable_env: terminal.process_launch_config.executable_env,
                options: terminal.process_launch_config.options,
                should_persist: true,
                workspace_id: details.workspace_id,
                workspace_name: details.workspace_name,
            },
            true,
            Some(first.data),
        )?;

        let old_id = reviving_process_key(workspace_id, terminal.id);
        tracing::info!("Revived process, old id {} -> new id {}", old_id, new_id);
        self.revived_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(old_id, new_id);
        Ok(())
    }

    pub fn get_revived_pty_new_id(&self, workspace_id: &str, id: SessionId) -> Option<SessionId> {
        let key = reviving_process_key(workspace_id, id);
        let new_id = self
            .revived_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .copied();
        if new_id.is_none() {
            tracing::debug!("Couldn't find terminal ID {}", key);
        }
        new_id
    }

    pub fn set_terminal_layout_info(&self, args: SetTerminalLayoutInfoArgs) {
        self.layouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(args);
    }

    /// Resolve a stored layout against live sessions, following revivals
    pub async fn get_terminal_layout_info(&self, workspace_id: &str) -> Option<TerminalsLayoutInfo> {
        let layout = self
            .layouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workspace_id)?;
        let mut guard = ExpansionGuard::default();

        // Claim ids in layout order first, then gather details concurrently
        let mut pending_tabs = Vec::with_capacity(layout.tabs.len());
        for tab in layout.tabs {
            let active = tab
                .active_persistent_process_id
                .map(|id| self.resolve_layout_id(workspace_id, id, false));
            let terminals: Vec<_> = tab
                .terminals
                .into_iter()
                .filter_map(|t| {
                    self.claim_instance(workspace_id, t.terminal, &mut guard)
                        .map(|task| (t.relative_size, task))
                })
                .collect();
            pending_tabs.push((tab.is_active, active, terminals));
        }
        let pending_background: Vec<_> = layout
            .background
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.claim_instance(workspace_id, id, &mut guard))
            .collect();

        let mut tabs = Vec::new();
        for (is_active, active_persistent_process_id, pending) in pending_tabs {
            let mut terminals = Vec::new();
            for (relative_size, task) in pending {
                if let Some(terminal) = join_details(task).await {
                    terminals.push(TerminalInstanceLayoutInfo {
                        relative_size,
                        terminal,
                    });
                }
            }
            if !terminals.is_empty() {
                tabs.push(TerminalTabLayoutInfo {
                    is_active,
                    active_persistent_process_id,
                    terminals,
                });
            }
        }

        let mut background = Vec::new();
        for task in pending_background {
            if let Some(details) = join_details(task).await {
                background.push(details);
            }
        }

        Some(TerminalsLayoutInfo { tabs, background })
    }

    /// Map a stored id to its revived id, optionally consuming the mapping
    fn resolve_layout_id(&self, workspace_id: &str, id: SessionId, consume: bool) -> SessionId {
        let key = reviving_process_key(workspace_id, id);
        let mut revived = self.revived_ids.lock().unwrap_or_else(PoisonError::into_inner);
        let new_id = if consume {
            revived.remove(&key)
        } else {
            revived.get(&key).copied()
        };
        new_id.unwrap_or(id)
    }

    fn claim_instance(
        &self,
        workspace_id: &str,
        stored_id: SessionId,
        guard: &mut ExpansionGuard,
    ) -> Option<JoinHandle<ProcessDetails>> {
        let key = reviving_process_key(workspace_id, stored_id);
        let revived = self
            .revived_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        tracing::info!("Expanding terminal instance, old id {} -> new id {:?}", key, revived);

        let id = revived.unwrap_or(stored_id);
        if !guard.claim(id) {
            tracing::warn!("Terminal {} has already been expanded", id);
            return None;
        }
        let pty = match self.get_pty(id) {
            Ok(pty) => pty,
            Err(e) => {
                tracing::warn!("Couldn't get layout info, a terminal was probably disconnected: {}", e);
                return None;
            }
        };
        let was_revived = revived.is_some();
        Some(tokio::spawn(async move {
            let mut details = pty.details(was_revived).await;
            details.id = id;
            details
        }))
    }

    /// Ask clients which session backs `instance_id` so it can be moved
    /// to another window. Resolves to `None` if the instance has none.
    pub async fn request_detach_instance(
        &self,
        workspace_id: &str,
        instance_id: SessionId,
    ) -> Result<Option<ProcessDetails>> {
        let events = self.events.clone();
        let workspace_id = workspace_id.to_string();
        self.detach_requests
            .create_request(move |request_id| {
                let _ = events.send(PtyHostEvent::DidRequestDetach {
                    request_id,
                    workspace_id,
                    instance_id,
                });
            })
            .await
    }

    pub async fn accept_detach_instance_reply(&self, request_id: u64, persistent_process_id: Option<SessionId>) {
        let details = match persistent_process_id.map(|id| self.get_pty(id)) {
            Some(Ok(pty)) => Some(pty.details(false).await),
            _ => None,
        };
        self.detach_requests.accept_reply(request_id, details);
    }

    pub async fn free_port_kill_process(&self, port: &str) -> Result<(String, String)> {
        system::free_port_kill_process(port).await
    }

    pub async fn get_wsl_path(&self, original: &str, direction: WslPathDirection) -> String {
        system::get_wsl_path(original, direction).await
    }

    pub fn get_default_system_shell(&self, os: Option<OperatingSystem>) -> String {
        let env: HashMap<String, String> = std::env::vars().collect();
        system::default_system_shell(os.unwrap_or_else(OperatingSystem::current), &env)
    }

    pub fn get_environment(&self) -> HashMap<String, String> {
        std::env::vars().collect()
    }
}

async fn join_details(task: JoinHandle<ProcessDetails>) -> Option<ProcessDetails> {
    match task.await {
        Ok(details) => Some(details),
        Err(e) => {
            tracing::warn!("Couldn't get layout info: {}", e);
            None
        }
    }
}

impl Drop for PtyService {
    fn drop(&mut self) {
        if let Some(heartbeat) = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            heartbeat.abort();
        }
        self.shutdown_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::layout::{TerminalInstanceLayoutInfoById, TerminalTabLayoutInfoById};
    use crate::session::persistence::parse_terminal_state;
    use crate::session::protocol::{InteractionState, ShellLaunchConfig};
    use crate::test_utils::{assert_eventually_bool, FakeProcessFactory};
    use std::time::Duration;

    fn service() -> (PtyService, Arc<FakeProcessFactory>) {
        let factory = FakeProcessFactory::new();
        let service = PtyService::new(ServiceOptions::default(), factory.clone());
        (service, factory)
    }

    fn args(should_persist: bool) -> CreateProcessArgs {
        CreateProcessArgs {
            shell_launch_config: ShellLaunchConfig {
                executable: Some("/bin/bash".into()),
                ..Default::default()
            },
            cwd: "/home/me".into(),
            cols: 80,
            rows: 24,
            should_persist,
            workspace_id: "ws".into(),
            workspace_name: "Workspace".into(),
            ..Default::default()
        }
    }

    async fn wait_for_output(events: &mut broadcast::Receiver<PtyHostEvent>, id: SessionId) {
        assert_eventually_bool(
            "output to reach subscribers",
            Duration::from_secs(1),
            Duration::from_millis(5),
            || {
                let arrived = std::iter::from_fn(|| events.try_recv().ok()).any(
                    |event| matches!(event, PtyHostEvent::ProcessData { id: from, .. } if from == id),
                );
                async move { arrived }
            },
        )
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejects_attach_marker() {
        let (service, _) = service();
        let mut a = args(true);
        a.shell_launch_config.attach_persistent_process = Some(3);
        assert!(matches!(
            service.create_process(a),
            Err(PtyHostError::AttachOnCreate)
        ));
        assert_eq!(service.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_sequential() {
        let (service, _) = service();
        assert_eq!(service.create_process(args(true)).unwrap(), 1);
        assert_eq!(service.create_process(args(true)).unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_ids() {
        let (service, _) = service();
        assert!(service.input(9, "x").unwrap_err().is_not_found());
        assert!(service.get_cwd(9).unwrap_err().is_not_found());
        service.shutdown(9, true);
        let err = service.start(9).unwrap();
        assert_eq!(err.message, "Could not find pty with id \"9\"");
        assert_eq!(service.get_revived_pty_new_id("ws", 9), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_removes_process_and_notifies() {
        let (service, factory) = service();
        let mut events = service.subscribe();
        let id = service.create_process(args(true)).unwrap();
        assert!(service.start(id).is_none());

        factory.last().unwrap().emit_exit(Some(1));
        assert_eventually_bool(
            "exited process to be dropped",
            Duration::from_secs(1),
            Duration::from_millis(5),
            || {
                let gone = service.process_count() == 0;
                async move { gone }
            },
        )
        .await;

        assert_eq!(service.process_count(), 0);
        let mut saw_exit = false;
        while let Ok(event) = events.try_recv() {
            if event == (PtyHostEvent::ProcessExit { id, exit_code: Some(1) }) {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
        assert!(service.input(id, "x").unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_fires() {
        let (service, _) = service();
        let mut events = service.subscribe();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(events.try_recv().unwrap(), PtyHostEvent::Heartbeat { beat: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialize_skips_untouched_sessions() {
        let (service, factory) = service();
        let mut events = service.subscribe();
        let used = service.create_process(args(true)).unwrap();
        let untouched = service.create_process(args(true)).unwrap();
        service.start(used);
        service.start(untouched);
        factory.created()[0].emit_data("$ echo hi\r\nhi\r\n");
        wait_for_output(&mut events, used).await;
        service.input(used, "echo hi\r").unwrap();
        service.detach_from_process(used, false).unwrap();

        let document = service.serialize_terminal_state(&[used, untouched]).await.unwrap();
        let state = parse_terminal_state(&document).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state[0].id, used);
        assert!(state[0].process_details.is_orphan);
        assert!(state[0].replay_event.events[0].data.contains("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialize_then_revive_seeds_banner() {
        let (service, factory) = service();
        let mut output = service.subscribe();
        let id = service.create_process(args(true)).unwrap();
        service.start(id);
        factory.last().unwrap().emit_data("previous output");
        wait_for_output(&mut output, id).await;
        service.input(id, "x").unwrap();
        service.detach_from_process(id, false).unwrap();

        let document = service.serialize_terminal_state(&[id]).await.unwrap();
        let state = parse_terminal_state(&document).unwrap();
        service.revive_terminal_processes("ws", state, "en").unwrap();

        let new_id = service.get_revived_pty_new_id("ws", id).unwrap();
        assert_ne!(new_id, id);
        // Lookup does not consume
        assert_eq!(service.get_revived_pty_new_id("ws", id), Some(new_id));

        let spec = factory.last_spec().unwrap();
        let initial_text = spec.shell_launch_config.initial_text.unwrap();
        assert!(initial_text.contains("previous output"));
        assert!(initial_text.contains("History restored"));
        assert_eq!(spec.cwd, "/home/me");
        assert_eq!(factory.last().unwrap().started_count(), 0, "revived processes are not started");

        let mut events = service.subscribe();
        service.start(new_id);
        let mut replayed = false;
        while let Ok(event) = events.try_recv() {
            if let PtyHostEvent::ProcessReplay { id, event } = event {
                assert_eq!(id, new_id);
                assert!(event.events[0].data.contains("previous output"));
                replayed = true;
            }
        }
        assert!(replayed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revive_keeps_api_titles_only() {
        let (service, factory) = service();
        let named = service.create_process(args(true)).unwrap();
        service.update_title(named, "build".into(), TitleSource::Api).unwrap();

        let document = service.serialize_terminal_state(&[named]).await.unwrap();
        let mut state = parse_terminal_state(&document).unwrap();
        assert_eq!(state[0].process_details.title, "build");
        service.revive_terminal_processes("ws", state.clone(), "en").unwrap();
        assert_eq!(
            factory.last_spec().unwrap().shell_launch_config.name.as_deref(),
            Some("build")
        );

        state[0].process_details.title_source = TitleSource::Process;
        service.revive_terminal_processes("ws2", state, "en").unwrap();
        assert_eq!(factory.last_spec().unwrap().shell_launch_config.name, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_processes_returns_detached_persistent_only() {
        let (service, _) = service();
        let detached = service.create_process(args(true)).unwrap();
        let ephemeral = service.create_process(args(false)).unwrap();
        service.start(detached);
        service.start(ephemeral);
        service.input(detached, "x").unwrap();
        service.detach_from_process(detached, false).unwrap();

        let listed = service.list_processes().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, detached);
        assert!(listed[0].is_orphan);
        assert_eq!(listed[0].cwd, "/home/me");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reduce_grace_time_applies_to_all() {
        let (service, factory) = service();
        let a = service.create_process(args(true)).unwrap();
        let b = service.create_process(args(true)).unwrap();
        for id in [a, b] {
            service.start(id);
            service.input(id, "x").unwrap();
            service.detach_from_process(id, false).unwrap();
        }
        service.reduce_connection_grace_time();
        tokio::time::sleep(Duration::from_secs(7)).await;

        for fake in factory.created() {
            assert_eq!(fake.shutdowns(), vec![true]);
        }
        assert_eq!(service.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_keeps_session_alive() {
        let (service, factory) = service();
        let id = service.create_process(args(true)).unwrap();
        service.start(id);
        service.input(id, "x").unwrap();
        service.detach_from_process(id, false).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        service.attach_to_process(id).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(factory.last().unwrap().shutdowns().is_empty());
        assert_eq!(service.process_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_layout_expansion_follows_revivals() {
        let (service, _) = service();
        let live = service.create_process(args(true)).unwrap();
        service.update_title(live, "live".into(), TitleSource::Api).unwrap();
        service.detach_from_process(live, false).unwrap();

        // Revive a snapshot that claimed id 77 in the previous host
        let document = service.serialize_terminal_state(&[live]).await.unwrap();
        let mut state = parse_terminal_state(&document).unwrap();
        state[0].id = 77;
        service.revive_terminal_processes("ws", state, "en").unwrap();
        let revived = service.get_revived_pty_new_id("ws", 77).unwrap();

        let tab = |ids: &[SessionId], active: Option<SessionId>| TerminalTabLayoutInfoById {
            is_active: true,
            active_persistent_process_id: active,
            terminals: ids
                .iter()
                .map(|&terminal| TerminalInstanceLayoutInfoById {
                    relative_size: 0.5,
                    terminal,
                })
                .collect(),
        };
        service.set_terminal_layout_info(SetTerminalLayoutInfoArgs {
            workspace_id: "ws".into(),
            tabs: vec![tab(&[77, 404], Some(77)), tab(&[revived], None)],
            background: Some(vec![77]),
        });

        let layout = service.get_terminal_layout_info("ws").await.unwrap();
        assert_eq!(layout.tabs.len(), 1, "a tab with nothing left to show is dropped");
        let terminals = &layout.tabs[0].terminals;
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].terminal.id, revived);
        assert!(terminals[0].terminal.is_orphan);
        assert_eq!(layout.tabs[0].active_persistent_process_id, Some(revived));
        assert!(layout.background.is_empty(), "the revived mapping is consumed once");

        // The mapping was consumed
        assert_eq!(service.get_revived_pty_new_id("ws", 77), None);
        assert!(service.get_terminal_layout_info("other").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_detach_instance_round_trip() {
        let service = Arc::new(service().0);
        let id = service.create_process(args(true)).unwrap();
        let mut events = service.subscribe();

        let requester = Arc::clone(&service);
        let request = tokio::spawn(async move { requester.request_detach_instance("ws", 12).await });

        let request_id = loop {
            if let PtyHostEvent::DidRequestDetach {
                request_id,
                instance_id: 12,
                ..
            } = events.recv().await.unwrap()
            {
                break request_id;
            }
        };
        // Answer the orphan question the details lookup asks
        let responder = Arc::clone(&service);
        let mut questions = responder.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = questions.recv().await {
                if let PtyHostEvent::OrphanQuestion { id } = event {
                    let _ = responder.orphan_question_reply(id);
                }
            }
        });
        service.accept_detach_instance_reply(request_id, Some(id)).await;

        let details = request.await.unwrap().unwrap().unwrap();
        assert_eq!(details.id, id);
        assert!(!details.is_orphan);
        assert_eq!(service.get_pty(id).unwrap().interaction_state(), InteractionState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_detach_instance_times_out() {
        let (service, _) = service();
        let err = service.request_detach_instance("ws", 1).await.unwrap_err();
        assert!(matches!(err, PtyHostError::RequestTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_stops_everything() {
        let (service, factory) = service();
        for _ in 0..3 {
            let id = service.create_process(args(true)).unwrap();
            service.start(id);
        }
        service.shutdown_all();
        assert_eq!(service.process_count(), 0);
        for fake in factory.created() {
            assert_eq!(fake.shutdowns(), vec![true]);
        }
    }

    #[test]
    fn test_banner_format() {
        assert_eq!(
            format_message_for_terminal("History restored"),
            "\r\n\x1b[0m\x1b[7m * \x1b[0;104m History restored \x1b[0m\n\r"
        );
    }

    #[test]
    fn test_restore_message_follows_locale() {
        assert_eq!(restore_message("en"), "History restored");
        assert_eq!(restore_message("de"), "Verlauf wiederhergestellt");
        assert_eq!(restore_message("pt-BR"), "Histórico restaurado");
        assert_eq!(restore_message("zh_CN"), "已还原历史记录");
        assert_eq!(restore_message("zh-TW"), "已還原歷程記錄");
        assert_eq!(restore_message("tlh"), "History restored");
        assert_eq!(restore_message(""), "History restored");
    }
}
