//! Single-flight supervision of the download utility.

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use protocol::{Root, TransferState};
use tokio::process::Command;
use tracing::{info, warn};

use super::args::{has_uri_scheme, transfer_args};
use super::process::{spawn_pump, Transfer};
use super::TransferError;
use crate::config::TransferConfig;
use crate::files::{FileError, PathResolver};

/// Launches transfers and keeps the latest one.
///
/// At most one transfer runs at a time. A finished transfer stays available
/// for status and polling until the next one replaces it.
pub struct TransferSupervisor {
    config: TransferConfig,
    resolver: PathResolver,
    slot: Mutex<Option<Arc<Transfer>>>,
}

impl TransferSupervisor {
    /// Create a supervisor writing into the raw root of `resolver`.
    pub fn new(config: TransferConfig, resolver: PathResolver) -> Self {
        Self {
            config,
            resolver,
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Transfer>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log a warning when the configured program is not on `PATH`.
    pub fn check_program(&self) -> bool {
        match which::which(&self.config.program) {
            Ok(path) => {
                info!(program = %path.display(), "Download utility found");
                true
            }
            Err(e) => {
                warn!(
                    program = %self.config.program,
                    error = %e,
                    "Download utility not found; transfers will fail until it is installed"
                );
                false
            }
        }
    }

    /// Launch a transfer.
    ///
    /// Must be called from within a Tokio runtime. A spawn failure still
    /// produces a transfer, already `failed`, whose log carries the error.
    pub fn start(&self, input: &str) -> Result<Arc<Transfer>, TransferError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TransferError::InvalidInput(
                "transfer input must not be empty".to_string(),
            ));
        }
        let target = self.resolve_input(input)?;

        let mut slot = self.lock();
        if let Some(current) = slot.as_ref() {
            if current.state() == TransferState::Running {
                return Err(TransferError::AlreadyRunning(current.id().clone()));
            }
        }

        let transfer = Transfer::new(input);
        let args = transfer_args(&self.config, self.resolver.base(Root::Raw), &target);

        let spawned = Command::new(&self.config.program)
            .args(&args)
            .current_dir(self.resolver.base(Root::Raw))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        match spawned {
            Ok(child) => {
                info!(
                    id = %transfer.id(),
                    program = %self.config.program,
                    pid = ?child.id(),
                    input = %input,
                    "Transfer started"
                );
                spawn_pump(Arc::clone(&transfer), child);
            }
            Err(e) => {
                warn!(id = %transfer.id(), program = %self.config.program, error = %e, "Failed to launch transfer");
                transfer.push_line(format!("failed to start {}: {}", self.config.program, e));
                transfer.finish(TransferState::Failed, None);
            }
        }

        *slot = Some(Arc::clone(&transfer));
        Ok(transfer)
    }

    /// Descriptor files already uploaded to the raw root are passed by their
    /// absolute path; everything else goes through verbatim.
    fn resolve_input(&self, input: &str) -> Result<String, TransferError> {
        if has_uri_scheme(input) {
            return Ok(input.to_string());
        }
        match self.resolver.resolve(Root::Raw, input) {
            Ok(path) if path.is_file() => Ok(path.to_string_lossy().into_owned()),
            Ok(_) => Ok(input.to_string()),
            Err(e @ FileError::Traversal(_)) => Err(TransferError::Path(e)),
            Err(_) => Ok(input.to_string()),
        }
    }

    /// The latest transfer, running or finished.
    pub fn current(&self) -> Option<Arc<Transfer>> {
        self.lock().clone()
    }

    /// Look a transfer up by id.
    pub fn get(&self, id: &str) -> Result<Arc<Transfer>, TransferError> {
        self.lock()
            .as_ref()
            .filter(|t| t.id() == id)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    /// Lines after `from`, the next cursor and the current state.
    pub fn poll(
        &self,
        id: &str,
        from: usize,
    ) -> Result<(Vec<String>, usize, TransferState), TransferError> {
        Ok(self.get(id)?.lines_from(from))
    }
}
