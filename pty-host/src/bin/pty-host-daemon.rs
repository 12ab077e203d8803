// pty-host-daemon: long-lived host for persistent terminal sessions
//
// Responsibilities:
// - Own the pty service and every live session
// - Expose the RPC surface over a Unix socket (newline-delimited JSON)
// - Forward host events to clients that subscribed
// - Save serialized sessions on shutdown so a new host can revive them

use anyhow::{Context, Result};
use pty_host_lib::{
    logging,
    session::{
        config::{Config, ServiceOptions},
        persistence::TerminalStateStore,
        protocol::{
            deserialize_message, serialize_message, PtyErrorCode, PtyHostEvent, PtyRequest,
            PtyResponse, MAX_REQUEST_FRAME_SIZE,
        },
        rpc::{dispatch, Tracer},
        runtime::PtyProcessFactory,
        service::PtyService,
    },
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

/// Daemon state shared across all client connections
struct DaemonState {
    service: PtyService,
    tracer: Tracer,
    saved_state: TerminalStateStore,
}

impl DaemonState {
    fn new(config: &Config, options: ServiceOptions) -> Self {
        Self {
            service: PtyService::new(options, Arc::new(PtyProcessFactory)),
            tracer: Tracer::new(options.simulated_latency),
            saved_state: TerminalStateStore::new(config),
        }
    }

    /// Snapshot every persistable session and write it to the state file
    async fn save_terminal_state(&self) -> Result<()> {
        let ids = self.service.persistable_ids();
        let document = self
            .service
            .serialize_terminal_state(&ids)
            .await
            .context("Failed to serialize terminal state")?;
        self.saved_state.save(&document)?;
        tracing::info!(
            "Saved terminal state for {} sessions to {}",
            ids.len(),
            self.saved_state.path().display()
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.save_terminal_state().await {
            tracing::error!("Failed to save terminal state: {:#}", e);
        }
        self.service.shutdown_all();
    }
}

/// Wait for the next event, or forever if the client never subscribed
async fn next_event(
    events: &mut Option<broadcast::Receiver<PtyHostEvent>>,
) -> Result<PtyHostEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a single client connection
async fn handle_client(
    state: Arc<DaemonState>,
    mut stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let mut events: Option<broadcast::Receiver<PtyHostEvent>> = None;

    loop {
        tokio::select! {
            // Handle incoming requests
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        // Client disconnected
                        break;
                    }
                    Ok(_) => {
                        let response = if line.len() > MAX_REQUEST_FRAME_SIZE {
                            PtyResponse::Error {
                                code: PtyErrorCode::InvalidRequest,
                                message: format!(
                                    "Request frame too large: {} bytes (max {})",
                                    line.len(),
                                    MAX_REQUEST_FRAME_SIZE
                                ),
                            }
                        } else {
                            match deserialize_message::<PtyRequest>(line.as_bytes()) {
                                Ok(request) => {
                                    match &request {
                                        PtyRequest::Subscribe if events.is_none() => {
                                            events = Some(state.service.subscribe());
                                        }
                                        PtyRequest::ShutdownHost => {
                                            let _ = shutdown_tx.send(()).await;
                                        }
                                        _ => {}
                                    }
                                    dispatch(&state.service, &state.tracer, &state.saved_state, request).await
                                }
                                Err(e) => PtyResponse::Error {
                                    code: PtyErrorCode::InvalidRequest,
                                    message: format!("Failed to parse request: {}", e),
                                },
                            }
                        };

                        let bytes = serialize_message(&response)?;
                        writer.write_all(&bytes).await?;
                        writer.flush().await?;

                        line.clear();
                    }
                    Err(e) => {
                        tracing::warn!("Error reading from client: {}", e);
                        break;
                    }
                }
            }

            // Forward host events to subscribed clients
            result = next_event(&mut events) => {
                match result {
                    Ok(event) => {
                        let bytes = serialize_message(&event)?;
                        if writer.write_all(&bytes).await.is_err() {
                            break; // Client disconnected
                        }
                        let _ = writer.flush().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Client lagged behind, skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    config
        .ensure_dirs()
        .context("Failed to create data directory")?;

    let log_to_file = std::env::var_os("PTY_HOST_LOG_FILE").is_some();
    logging::init(log_to_file.then(|| config.log_file()).as_deref());

    // Clean up stale socket if exists
    if config.socket_exists() {
        if config.is_daemon_running() {
            tracing::error!("Pty host already running (PID: {:?})", config.read_pid());
            std::process::exit(1);
        }
        config
            .remove_socket()
            .context("Failed to remove stale socket")?;
    }

    config.write_pid().context("Failed to write PID file")?;

    let options = ServiceOptions::from_env();
    tracing::debug!("Service options: {:?}", options);
    let state = Arc::new(DaemonState::new(&config, options));

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    // Owner-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }

    tracing::info!("Pty host listening on {}", config.socket_path.display());

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    // Handle SIGINT for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx_clone.send(()).await;
    });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(state, stream, shutdown_tx).await {
                                tracing::warn!("Client error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept error: {}", e);
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                tracing::info!("Shutting down pty host...");
                break;
            }
        }
    }

    state.shutdown().await;

    config.remove_pid().ok();
    config.remove_socket().ok();

    tracing::info!("Pty host stopped");
    Ok(())
}
