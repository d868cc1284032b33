//! Download utility supervision.
//!
//! A transfer is one run of the external download program (aria2c by
//! default). The [`TransferSupervisor`] allows a single running transfer,
//! captures its combined stdout/stderr into an ordered log, and classifies
//! the exit: status 0 is `succeeded`, anything else (non-zero exit, signal,
//! launch failure) is `failed`.
//!
//! Output can be observed in three ways, all backed by the same log:
//! - [`TransferSubscription`] yields lines as they are produced
//! - [`Transfer::lines_from`] returns lines after a cursor (polling)
//! - [`Transfer::wait`] resolves to the terminal [`TransferOutcome`]

pub mod args;
pub mod process;
pub mod supervisor;

use thiserror::Error;

use crate::files::FileError;

pub use args::{has_uri_scheme, transfer_args};
pub use process::{Transfer, TransferId, TransferOutcome, TransferSubscription};
pub use supervisor::TransferSupervisor;

/// Errors that can occur when starting or querying transfers.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Another transfer is still running.
    #[error("a transfer is already running: {0}")]
    AlreadyRunning(TransferId),

    /// The input cannot be used.
    #[error("invalid transfer input: {0}")]
    InvalidInput(String),

    /// The input named a path outside the raw root.
    #[error(transparent)]
    Path(#[from] FileError),

    /// No transfer with this id is known.
    #[error("transfer not found: {0}")]
    NotFound(TransferId),
}
