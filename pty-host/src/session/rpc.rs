// RPC surface of the pty host
//
// Maps each wire request onto a `PtyService` call and wraps it in a tracer
// that logs the call and can slow it down for latency testing.

use super::error::{PtyHostError, Result};
use super::persistence::TerminalStateStore;
use super::protocol::{PtyErrorCode, PtyRequest, PtyResponse};
use super::service::PtyService;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Debug renderings longer than this are logged at trace level only
const LARGE_PAYLOAD: usize = 1024;

/// Logs RPC calls and injects artificial latency
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracer {
    simulated_latency: Duration,
}

impl Tracer {
    pub fn new(simulated_latency: Duration) -> Self {
        Self { simulated_latency }
    }

    pub async fn trace<T, F>(&self, name: &str, args: &str, call: F) -> Result<T>
    where
        T: Debug,
        F: Future<Output = Result<T>>,
    {
        log_payload(&format!("[RPC Request] PtyService#{}", name), args);
        if !self.simulated_latency.is_zero() {
            tokio::time::sleep(self.simulated_latency).await;
        }

        let result = call.await;
        match &result {
            Ok(response) => log_payload(
                &format!("[RPC Response] PtyService#{}", name),
                &format!("{:?}", response),
            ),
            Err(e) => tracing::warn!("[RPC Response] PtyService#{} failed: {}", name, e),
        }
        result
    }
}

fn log_payload(prefix: &str, payload: &str) {
    if payload.len() > LARGE_PAYLOAD {
        tracing::trace!("{} {}", prefix, payload);
    } else {
        tracing::debug!("{} {}", prefix, payload);
    }
}

/// Arguments as they appear in the log, with bulky fields summarized
fn describe(request: &PtyRequest) -> String {
    match request {
        PtyRequest::Input { id, data } | PtyRequest::ProcessBinary { id, data } => {
            format!("id={} ({} chars)", id, data.chars().count())
        }
        PtyRequest::ReviveTerminalProcesses {
            workspace_id,
            state,
            locale,
        } => format!(
            "workspace_id={:?} locale={:?} ({} terminals)",
            workspace_id,
            locale,
            state.len()
        ),
        other => format!("{:?}", other),
    }
}

pub fn error_code(error: &PtyHostError) -> PtyErrorCode {
    match error {
        PtyHostError::NotFound(_) => PtyErrorCode::NotFound,
        PtyHostError::RequestTimedOut { .. } => PtyErrorCode::Timeout,
        PtyHostError::AttachOnCreate | PtyHostError::InvalidState(_) | PtyHostError::Json(_) => {
            PtyErrorCode::InvalidRequest
        }
        PtyHostError::FreePort(_) | PtyHostError::Io(_) => PtyErrorCode::Internal,
    }
}

/// Run one request against the service.
///
/// `subscribe` and `shutdown_host` only acknowledge here; the connection
/// handler acts on them.
pub async fn dispatch(
    service: &PtyService,
    tracer: &Tracer,
    saved_state: &TerminalStateStore,
    request: PtyRequest,
) -> PtyResponse {
    let method = request.method();
    let args = describe(&request);
    match tracer
        .trace(method, &args, handle(service, tracer, saved_state, request))
        .await
    {
        Ok(response) => response,
        Err(e) => PtyResponse::Error {
            code: error_code(&e),
            message: e.to_string(),
        },
    }
}

async fn handle(
    service: &PtyService,
    tracer: &Tracer,
    saved_state: &TerminalStateStore,
    request: PtyRequest,
) -> Result<PtyResponse> {
    let response = match request {
        PtyRequest::Subscribe | PtyRequest::ShutdownHost => PtyResponse::Ok,

        PtyRequest::CreateProcess(args) => PtyResponse::ProcessCreated {
            id: service.create_process(args)?,
        },
        PtyRequest::AttachToProcess { id } => {
            service.attach_to_process(id)?;
            PtyResponse::Ok
        }
        PtyRequest::DetachFromProcess { id, force_persist } => {
            service.detach_from_process(id, force_persist)?;
            PtyResponse::Ok
        }
        PtyRequest::Start { id } => PtyResponse::Started {
            error: service.start(id),
        },
        PtyRequest::Shutdown { id, immediate } => {
            service.shutdown(id, immediate);
            PtyResponse::Ok
        }
        PtyRequest::Input { id, data } => {
            service.input(id, &data)?;
            PtyResponse::Ok
        }
        PtyRequest::ProcessBinary { id, data } => {
            service.process_binary(id, &data)?;
            PtyResponse::Ok
        }
        PtyRequest::Resize { id, cols, rows } => {
            service.resize(id, cols, rows)?;
            PtyResponse::Ok
        }
        PtyRequest::ClearBuffer { id } => {
            service.clear_buffer(id)?;
            PtyResponse::Ok
        }
        PtyRequest::GetCwd { id } => PtyResponse::Cwd {
            cwd: service.get_cwd(id)?,
        },
        PtyRequest::GetInitialCwd { id } => PtyResponse::Cwd {
            cwd: service.get_initial_cwd(id)?,
        },
        PtyRequest::SetTitle {
            id,
            title,
            title_source,
        } => {
            service.update_title(id, title, title_source)?;
            PtyResponse::Ok
        }
        PtyRequest::SetIcon {
            id,
            user_initiated,
            icon,
            color,
        } => {
            service.update_icon(id, user_initiated, icon, color)?;
            PtyResponse::Ok
        }
        PtyRequest::SendSignal { id, signal } => {
            service.send_signal(id, &signal)?;
            PtyResponse::Ok
        }
        PtyRequest::AcknowledgeDataEvent { id, char_count } => {
            service.acknowledge_data_event(id, char_count)?;
            PtyResponse::Ok
        }
        PtyRequest::SetUnicodeVersion { id, version } => {
            service.set_unicode_version(id, version)?;
            PtyResponse::Ok
        }
        PtyRequest::SetNextCommandId {
            id,
            command_line,
            command_id,
        } => {
            service.set_next_command_id(id, command_line, command_id)?;
            PtyResponse::Ok
        }
        PtyRequest::RefreshProperty { id, property } => PtyResponse::Property {
            value: service.refresh_property(id, property)?,
        },
        PtyRequest::UpdateProperty { id, property } => {
            service.update_property(id, property)?;
            PtyResponse::Ok
        }
        PtyRequest::OrphanQuestionReply { id } => {
            service.orphan_question_reply(id)?;
            PtyResponse::Ok
        }
        PtyRequest::ListProcesses => PtyResponse::Processes {
            processes: service.list_processes().await,
        },
        PtyRequest::ReduceConnectionGraceTime => {
            service.reduce_connection_grace_time();
            PtyResponse::Ok
        }
        PtyRequest::SerializeTerminalState { ids } => PtyResponse::SerializedState {
            state: service.serialize_terminal_state(&ids).await?,
        },
        PtyRequest::ReviveTerminalProcesses {
            workspace_id,
            state,
            locale,
        } => {
            service.revive_terminal_processes(&workspace_id, state, &locale)?;
            PtyResponse::Ok
        }
        PtyRequest::GetRevivedPtyNewId { workspace_id, id } => PtyResponse::RevivedId {
            new_id: service.get_revived_pty_new_id(&workspace_id, id),
        },
        PtyRequest::SetTerminalLayoutInfo(args) => {
            service.set_terminal_layout_info(args);
            PtyResponse::Ok
        }
        PtyRequest::GetTerminalLayoutInfo { workspace_id } => PtyResponse::Layout {
            layout: service.get_terminal_layout_info(&workspace_id).await,
        },
        PtyRequest::RequestDetachInstance {
            workspace_id,
            instance_id,
        } => PtyResponse::DetachedInstance {
            details: service
                .request_detach_instance(&workspace_id, instance_id)
                .await?,
        },
        PtyRequest::AcceptDetachInstanceReply {
            request_id,
            persistent_process_id,
        } => {
            service
                .accept_detach_instance_reply(request_id, persistent_process_id)
                .await;
            PtyResponse::Ok
        }
        PtyRequest::FreePortKillProcess { port } => {
            let (port, process_id) = service.free_port_kill_process(&port).await?;
            PtyResponse::PortFreed { port, process_id }
        }
        PtyRequest::GetWslPath { path, direction } => PtyResponse::WslPath {
            path: service.get_wsl_path(&path, direction).await,
        },
        PtyRequest::GetDefaultSystemShell { os } => PtyResponse::DefaultShell {
            shell: service.get_default_system_shell(os),
        },
        PtyRequest::GetEnvironment => PtyResponse::Environment {
            env: service.get_environment(),
        },
        PtyRequest::GetLatency => {
            let sent = Instant::now();
            tracer.trace("getLatency", "", async { Ok(()) }).await?;
            PtyResponse::Latency {
                label: "ptyHost".to_string(),
                latency_ms: sent.elapsed().as_secs_f64() * 1000.0,
            }
        }
        PtyRequest::GetSavedTerminalState => {
            let document = saved_state.load().map_err(|e| {
                PtyHostError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{:#}", e),
                ))
            })?;
            PtyResponse::SavedState { document }
        }
    };
    Ok(response)
}
