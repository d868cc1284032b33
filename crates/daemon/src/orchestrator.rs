//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that prepares the storage
//! roots, builds the message router, and serves the IPC socket until a
//! shutdown is requested by a signal or a client `Stop` request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::{ErrorCode, Request, Response};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::files::{sweep_scratch, PathResolver, Roots};
use crate::ipc::pidfile::{get_pid_file_path, remove_pid_file, write_pid_file};
use crate::ipc::{IpcConnection, IpcServer};
use crate::router::MessageRouter;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the socket.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connected.
    ClientConnected { id: u64 },
    /// A client disconnected.
    ClientDisconnected { id: u64 },
    /// A client asked the daemon to stop.
    StopRequested,
    /// Error occurred.
    Error { message: String },
}

/// Create the storage roots and the scratch directory, clearing leftovers
/// from a previous run.
pub fn prepare_storage(config: &Config) -> Result<PathResolver> {
    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let roots = Roots::prepare(&config.downloads_dir(), &config.extracted_dir())
        .context("Failed to prepare storage roots")?;

    let scratch = config.scratch_dir();
    std::fs::create_dir_all(&scratch)
        .with_context(|| format!("Failed to create scratch directory: {}", scratch.display()))?;
    match sweep_scratch(&scratch) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "Removed leftover scratch files"),
        Err(e) => warn!(error = %e, "Failed to sweep scratch directory"),
    }

    Ok(PathResolver::new(roots))
}

/// Shared state handed to connection tasks.
#[derive(Clone)]
struct ConnectionContext {
    router: Arc<MessageRouter>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    active: Arc<AtomicUsize>,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Message router.
    router: Arc<MessageRouter>,
    /// Number of connected clients.
    active_connections: Arc<AtomicUsize>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let resolver = prepare_storage(&config)?;
        info!(
            downloads = %resolver.base(protocol::Root::Raw).display(),
            extracted = %resolver.base(protocol::Root::Extracted).display(),
            "Storage roots ready"
        );

        let router = Arc::new(MessageRouter::new(&config, resolver));
        router.transfers().check_program();

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            router,
            active_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Path of the IPC socket.
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    /// Starts serving the IPC socket.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let socket_path = self.config.socket_path();
        let server = IpcServer::bind(&socket_path)
            .await
            .with_context(|| format!("Failed to bind socket: {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "Listening for clients");

        let pid_path = get_pid_file_path(&self.config.daemon.data_dir);
        write_pid_file(&pid_path)
            .with_context(|| format!("Failed to write PID file: {}", pid_path.display()))?;

        let ctx = ConnectionContext {
            router: Arc::clone(&self.router),
            shutdown_token: self.shutdown_token.clone(),
            event_tx: self.event_tx.clone(),
            active: Arc::clone(&self.active_connections),
        };
        tokio::spawn(Self::accept_loop(server, ctx));

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Accepts clients until shutdown, one task per connection.
    async fn accept_loop(server: IpcServer, ctx: ConnectionContext) {
        let next_id = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = ctx.shutdown_token.cancelled() => {
                    debug!("Accept loop received shutdown signal");
                    break;
                }
                result = server.accept() => match result {
                    Ok(conn) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(id, conn, ctx).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        let _ = ctx.event_tx.send(OrchestratorEvent::Error {
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Serves requests from one client until it disconnects.
    async fn handle_connection(id: u64, mut conn: IpcConnection, ctx: ConnectionContext) {
        ctx.active.fetch_add(1, Ordering::Relaxed);
        let _ = ctx.event_tx.send(OrchestratorEvent::ClientConnected { id });
        debug!(client = id, "Client connected");

        loop {
            let next = tokio::select! {
                _ = ctx.shutdown_token.cancelled() => break,
                next = conn.read_request() => next,
            };

            match next {
                Ok(None) => break,
                Ok(Some(request)) => {
                    let stop = matches!(request, Request::Stop);
                    if let Err(e) = ctx.router.dispatch(request, &mut conn).await {
                        debug!(client = id, error = %e, "Failed to send response");
                        break;
                    }
                    if stop {
                        info!(client = id, "Stop requested by client");
                        let _ = ctx.event_tx.send(OrchestratorEvent::StopRequested);
                        ctx.shutdown_token.cancel();
                        break;
                    }
                }
                Err(e) => {
                    warn!(client = id, error = %e, "Rejected malformed request");
                    let reply = Response::error(ErrorCode::InvalidRequest, e.to_string());
                    if conn.send_response(&reply).await.is_err() || !e.is_recoverable() {
                        break;
                    }
                }
            }
        }

        ctx.active.fetch_sub(1, Ordering::Relaxed);
        let _ = ctx.event_tx.send(OrchestratorEvent::ClientDisconnected { id });
        debug!(client = id, "Client disconnected");
    }

    /// Stops the daemon orchestrator gracefully.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        if let Some(transfer) = self.router.transfers().current() {
            if !transfer.state().is_terminal() {
                warn!(id = %transfer.id(), "Leaving running transfer behind");
            }
        }

        let socket_path = self.config.socket_path();
        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %socket_path.display(), error = %e, "Failed to remove socket");
            }
        }
        remove_pid_file(&get_pid_file_path(&self.config.daemon.data_dir));

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Returns the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
