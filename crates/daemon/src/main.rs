//! Fetchbox
//!
//! Daemon and command-line client for the Fetchbox file drop box.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use daemon::config::Config;
use daemon::files::format_size;
use daemon::ipc::{get_daemon_pid, get_pid_file_path, IpcClient};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use protocol::{
    Entry, EntryKind, Request, Response, Root, TransferMode, TransferState, UploadFile,
};
use tokio::io::AsyncWriteExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Fetchbox - file drop box with archive tools and a download supervisor.
#[derive(Parser, Debug)]
#[command(name = "fetchbox")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Serve,

    /// Show daemon status
    Status,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// List a directory
    Ls {
        /// Storage root
        #[arg(long, short, value_enum, default_value = "raw")]
        root: RootArg,

        /// Directory path inside the root
        #[arg(default_value = "")]
        path: String,
    },

    /// Upload files into the downloads root
    Upload {
        /// Local files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination directory inside the downloads root
        #[arg(long, short, default_value = "")]
        dir: String,
    },

    /// Download a file
    Get {
        /// Storage root
        #[arg(long, short, value_enum, default_value = "raw")]
        root: RootArg,

        /// File path inside the root
        path: String,

        /// Local output path (defaults to the file name)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Download a directory as a ZIP archive
    Pack {
        /// Storage root
        #[arg(long, short, value_enum, default_value = "raw")]
        root: RootArg,

        /// Directory path inside the root
        #[arg(default_value = "")]
        path: String,

        /// Local output path (defaults to the archive name)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Delete a file or directory
    Rm {
        /// Storage root
        #[arg(long, short, value_enum, default_value = "raw")]
        root: RootArg,

        /// Path inside the root
        path: String,
    },

    /// Extract an archive from the downloads root
    Extract {
        /// Archive path inside the downloads root
        path: String,
    },

    /// Show disk usage of the downloads volume
    Df,

    /// Start a download
    Fetch {
        /// URI, magnet link, or descriptor file in the downloads root
        input: String,

        /// Return immediately with the transfer id
        #[arg(long, conflicts_with = "wait")]
        detach: bool,

        /// Print the whole log once the transfer finishes
        #[arg(long)]
        wait: bool,
    },

    /// Show output of a transfer
    Transfer {
        /// Transfer id
        id: String,

        /// First log line to show
        #[arg(long, default_value = "0")]
        from: usize,
    },
}

/// Storage root selector.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootArg {
    /// Uploads and finished downloads
    Raw,
    /// Extracted archives
    Extracted,
}

impl From<RootArg> for Root {
    fn from(arg: RootArg) -> Self {
        match arg {
            RootArg::Raw => Root::Raw,
            RootArg::Extracted => Root::Extracted,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    config.apply_env_overrides();
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let log_dir = matches!(cli.command, Commands::Serve).then(|| config.log_dir());
    let _guard = init_tracing(level, log_dir.as_deref())?;

    if let Some(path) = &cli.config {
        tracing::debug!(config = %path.display(), "Using config file");
    }

    match cli.command {
        Commands::Serve => {
            let pid_path = get_pid_file_path(&config.daemon.data_dir);
            if let Some(pid) = get_daemon_pid(&pid_path) {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  fetchbox stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::Stop { force, timeout } => {
            tracing::info!(force, "Stopping daemon");

            let result = if force {
                force_stop_daemon(&config)
            } else {
                graceful_stop_daemon(&config, timeout).await
            };
            match result {
                Ok(()) => println!("Daemon stopped successfully"),
                Err(e) => {
                    eprintln!("Failed to stop daemon: {:#}", e);
                    if !force {
                        eprintln!("Try: fetchbox stop --force");
                    }
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let mut client = connect(&config).await?;
            match client.status().await? {
                Response::Status {
                    version,
                    uptime_secs,
                    transfer,
                } => {
                    println!("Daemon Status: running");
                    println!("  Protocol: v{}", version);
                    println!("  Uptime:   {}", format_duration(uptime_secs));
                    match transfer {
                        Some(t) => {
                            println!("  Transfer: {} ({})", t.id, t.state);
                            println!("    Input:  {}", t.input);
                            println!("    Lines:  {}", t.lines);
                        }
                        None => println!("  Transfer: none"),
                    }
                }
                other => fail(other)?,
            }
        }
        Commands::Ls { root, path } => {
            let mut client = connect(&config).await?;
            match client
                .send(Request::List {
                    root: root.into(),
                    path,
                })
                .await?
            {
                Response::Listing { entries, .. } => print_listing(&entries),
                other => fail(other)?,
            }
        }
        Commands::Upload { files, dir } => {
            let mut payload = Vec::with_capacity(files.len());
            for file in &files {
                let name = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("Invalid file name: {}", file.display()))?
                    .to_string();
                let data = tokio::fs::read(file)
                    .await
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                payload.push(UploadFile { name, data });
            }

            let mut client = connect(&config).await?;
            client
                .write_request(&Request::Upload {
                    path: dir,
                    files: payload,
                })
                .await?;
            match client.read_response().await? {
                Response::Ok => println!("Uploaded {} file(s)", files.len()),
                other => fail(other)?,
            }
        }
        Commands::Get { root, path, output } => {
            let mut client = connect(&config).await?;
            client
                .write_request(&Request::Download {
                    root: root.into(),
                    path,
                })
                .await?;
            receive_file(&mut client, output).await?;
        }
        Commands::Pack { root, path, output } => {
            let mut client = connect(&config).await?;
            client
                .write_request(&Request::Package {
                    root: root.into(),
                    path,
                })
                .await?;
            receive_file(&mut client, output).await?;
        }
        Commands::Rm { root, path } => {
            let mut client = connect(&config).await?;
            match client
                .send(Request::Delete {
                    root: root.into(),
                    path: path.clone(),
                })
                .await?
            {
                Response::Ok => println!("Deleted {}:/{}", Root::from(root), path),
                other => fail(other)?,
            }
        }
        Commands::Extract { path } => {
            let mut client = connect(&config).await?;
            client
                .write_request(&Request::Extract { path: path.clone() })
                .await?;
            match client.read_response().await? {
                Response::Ok => println!("Extracted {}", path),
                other => fail(other)?,
            }
        }
        Commands::Df => {
            let mut client = connect(&config).await?;
            match client.send(Request::DiskUsage).await? {
                Response::DiskUsage {
                    total,
                    free,
                    used_percent,
                } => {
                    println!("Total: {}", total);
                    println!("Free:  {}", free);
                    println!("Used:  {:.1}%", used_percent);
                }
                other => fail(other)?,
            }
        }
        Commands::Fetch {
            input,
            detach,
            wait,
        } => {
            let mode = if detach {
                TransferMode::Detach
            } else if wait {
                TransferMode::Wait
            } else {
                TransferMode::Follow
            };
            let mut client = connect(&config).await?;
            client
                .write_request(&Request::StartTransfer { input, mode })
                .await?;
            let state = follow_transfer(&mut client, mode).await?;
            if state == Some(TransferState::Failed) {
                std::process::exit(1);
            }
        }
        Commands::Transfer { id, from } => {
            let mut client = connect(&config).await?;
            match client.send(Request::PollTransfer { id, from }).await? {
                Response::TransferProgress {
                    id,
                    state,
                    lines,
                    next,
                } => {
                    for line in &lines {
                        println!("{}", line);
                    }
                    eprintln!("Transfer {}: {} (next line: {})", id, state, next);
                }
                other => fail(other)?,
            }
        }
    }

    Ok(())
}

/// Initialize stderr logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "fetchbox.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

/// Connect to the daemon socket.
async fn connect(config: &Config) -> anyhow::Result<IpcClient> {
    let socket_path = config.socket_path();
    IpcClient::connect(&socket_path).await.with_context(|| {
        format!(
            "Cannot connect to daemon at {} (is `fetchbox serve` running?)",
            socket_path.display()
        )
    })
}

/// Turn an unexpected or error response into an error.
fn fail(response: Response) -> anyhow::Result<()> {
    match response {
        Response::Error { code, message } => {
            anyhow::bail!("Daemon returned error ({:?}): {}", code, message)
        }
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }
}

/// Receive a FileStart/FileChunk/FileEnd stream into a local file.
async fn receive_file(client: &mut IpcClient, output: Option<PathBuf>) -> anyhow::Result<()> {
    let (name, size) = match client.read_response().await? {
        Response::FileStart { name, size } => (name, size),
        other => return fail(other),
    };

    let target = output.unwrap_or_else(|| PathBuf::from(&name));
    let mut file = tokio::fs::File::create(&target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;

    let mut received = 0u64;
    loop {
        match client.read_response().await? {
            Response::FileChunk { data } => {
                file.write_all(&data).await?;
                received += data.len() as u64;
            }
            Response::FileEnd => break,
            other => {
                drop(file);
                let _ = tokio::fs::remove_file(&target).await;
                return fail(other);
            }
        }
    }
    file.flush().await?;

    if received != size {
        anyhow::bail!("Expected {} bytes, received {}", size, received);
    }
    println!("Saved {} ({})", target.display(), format_size(size));
    Ok(())
}

/// Print transfer responses until the daemon stops sending them.
///
/// Returns the final state, or `None` for a detached start.
async fn follow_transfer(
    client: &mut IpcClient,
    mode: TransferMode,
) -> anyhow::Result<Option<TransferState>> {
    loop {
        match client.read_response().await? {
            Response::TransferStarted { id } => {
                if mode == TransferMode::Detach {
                    println!("{}", id);
                    return Ok(None);
                }
                eprintln!("Transfer {} started", id);
            }
            Response::TransferLine { line } => println!("{}", line),
            Response::TransferResult {
                id,
                state,
                exit_code,
                log,
            } => {
                // Follow mode already printed every line as it arrived.
                if mode == TransferMode::Wait {
                    for line in &log {
                        println!("{}", line);
                    }
                }
                match exit_code {
                    Some(code) => eprintln!("Transfer {}: {} (exit code {})", id, state, code),
                    None => eprintln!("Transfer {}: {}", id, state),
                }
                return Ok(Some(state));
            }
            other => {
                fail(other)?;
                return Ok(None);
            }
        }
    }
}

/// Print a directory listing as a table.
///
/// Directories get a trailing `/`, archives a trailing `*`.
fn print_listing(entries: &[Entry]) {
    if entries.is_empty() {
        println!("Empty directory.");
        return;
    }

    let rows: Vec<(String, String, String, String)> = entries
        .iter()
        .map(|entry| {
            let (name, size) = match entry.kind {
                EntryKind::Directory => (format!("{}/", entry.name), "-".to_string()),
                EntryKind::File => (
                    entry.name.clone(),
                    format_size(entry.size.unwrap_or_default()),
                ),
            };
            let name = if entry.is_archive {
                format!("{}*", name)
            } else {
                name
            };
            let category = format!("{:?}", entry.category).to_lowercase();
            (name, size, category, format_relative_time(entry.modified))
        })
        .collect();

    let name_width = rows.iter().map(|r| r.0.len()).max().unwrap_or(4).max(4);

    println!(
        "{:<name_width$}  {:>10}  {:<9}  {:>10}",
        "NAME",
        "SIZE",
        "CATEGORY",
        "MODIFIED",
        name_width = name_width
    );
    println!("{}", "-".repeat(name_width + 37));

    for (name, size, category, modified) in &rows {
        println!(
            "{:<name_width$}  {:>10}  {:<9}  {:>10}",
            name,
            size,
            category,
            modified,
            name_width = name_width
        );
    }

    println!();
    println!("Total: {} entries", rows.len());
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(timestamp);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a stop request and waits for the socket to disappear.
async fn graceful_stop_daemon(config: &Config, timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = config.socket_path();

    let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client
        .stop()
        .await
        .context("Failed to send stop request")?
    {
        Response::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => fail(other)?,
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }

        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon using SIGKILL.
///
/// Reads the daemon PID from the PID file and sends SIGKILL.
fn force_stop_daemon(config: &Config) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = get_pid_file_path(&config.daemon.data_dir);
    let pid = get_daemon_pid(&pid_path)
        .context("Daemon PID file not found - is the daemon running?")?;
    let raw = i32::try_from(pid).context("Invalid PID in file")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;

    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(config.socket_path());

    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or a client stop request.
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(?state, "Orchestrator state");
                }
                OrchestratorEvent::ClientConnected { id } => {
                    tracing::debug!(client = id, "Client connected");
                }
                OrchestratorEvent::ClientDisconnected { id } => {
                    tracing::debug!(client = id, "Client disconnected");
                }
                OrchestratorEvent::StopRequested => {
                    tracing::info!("Stop requested over IPC");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {}
    }

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
