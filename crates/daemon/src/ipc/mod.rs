//! Unix Domain Socket IPC module for client-daemon communication.
//!
//! ## Overview
//!
//! The IPC system uses the newline-delimited JSON protocol from the
//! `protocol` crate. Each message is a single JSON object followed by a
//! newline. Every file and transfer operation is reachable through it.
//!
//! ## Socket Path
//!
//! `daemon.socket_path` from the configuration, defaulting to
//! `<data_dir>/fetchbox.sock`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::IpcClient;
//! use daemon::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default()?;
//!     let mut client = IpcClient::connect(&config.socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running};
pub use server::{IpcConnection, IpcError, IpcServer};
