//! PID file utilities for daemon running detection.
//!
//! The PID file lives at `<data_dir>/fetchbox.pid`. A file whose process is
//! gone, or whose content does not parse, is stale and removed on sight.
//!
//! ## Example
//!
//! ```rust
//! use daemon::ipc::pidfile::{get_daemon_pid, get_pid_file_path};
//!
//! let path = get_pid_file_path(std::path::Path::new("/tmp/fetchbox-doc"));
//! if let Some(pid) = get_daemon_pid(&path) {
//!     println!("Daemon is already running with PID {}", pid);
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the path to the daemon PID file under a data directory.
pub fn get_pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("fetchbox.pid")
}

/// Whether a live process is recorded in the PID file.
pub fn is_daemon_running(pid_path: &Path) -> bool {
    get_daemon_pid(pid_path).is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Stale PID files are cleaned up.
pub fn get_daemon_pid(pid_path: &Path) -> Option<u32> {
    let pid_str = fs::read_to_string(pid_path).ok()?;

    let pid: u32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => {
            cleanup_stale_pid_file(pid_path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        cleanup_stale_pid_file(pid_path);
        None
    }
}

/// Record the current process in the PID file.
pub fn write_pid_file(pid_path: &Path) -> io::Result<()> {
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(pid_path, format!("{}\n", std::process::id()))
}

/// Remove the PID file if it names the current process.
pub fn remove_pid_file(pid_path: &Path) {
    let owned = fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);
    if owned {
        cleanup_stale_pid_file(pid_path);
    }
}

/// Check if a process with the given PID exists (signal 0).
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Remove a stale PID file.
fn cleanup_stale_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale PID file");
        }
    } else {
        tracing::debug!(path = %path.display(), "Removed PID file");
    }
}
