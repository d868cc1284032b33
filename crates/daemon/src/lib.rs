//! # Fetchbox Daemon Library
//!
//! This crate provides the daemon behind Fetchbox, a small file drop box
//! with archive tools and a download supervisor.
//!
//! ## Overview
//!
//! The daemon owns two storage roots on the host:
//!
//! - **downloads** (`raw`): uploads and finished downloads land here
//! - **extracted**: each extracted archive gets its own directory here
//!
//! On top of them it provides:
//!
//! - **File Operations**: list, upload, download, delete, package as ZIP
//! - **Extraction**: unpack archives from the downloads root
//! - **Transfers**: run one external downloader at a time with live output
//! - **Disk Usage**: capacity of the volume holding the downloads root
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                 IPC Server (Unix socket)                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                   Message Router                           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌──────────┐ ┌───────────┐ ┌───────────┐ ┌──────────────────┐  │
//! │  │ Catalog  │ │   Store   │ │ Packager  │ │    Extraction    │  │
//! │  └──────────┘ └───────────┘ └───────────┘ └──────────────────┘  │
//! │  ┌────────────────────────┐ ┌────────────────────────────────┐  │
//! │  │     Path Resolver      │ │      Transfer Supervisor       │  │
//! │  └────────────────────────┘ └────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     orchestrator.shutdown_token().cancelled().await;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`files`]: Path resolution, listings, storage, packaging, extraction
//! - [`transfer`]: External downloader supervision
//! - [`ipc`]: Unix socket server, client and PID file
//! - [`router`]: Request routing to components
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod files;
pub mod ipc;
pub mod orchestrator;
pub mod router;
pub mod transfer;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export files types for convenience
pub use files::{
    ArchivePackager, DirectoryCatalog, ExtractionService, FileError, FileStore, PathResolver,
    Roots,
};

// Re-export transfer types for convenience
pub use transfer::{Transfer, TransferError, TransferSupervisor};

// Re-export router types for convenience
pub use router::{MessageRouter, ResponseSink, RouterError, RouterResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
