//! Errors shared by the file components.

use protocol::Root;
use thiserror::Error;

/// Errors that can occur while operating on the storage roots.
///
/// Paths are reported in their virtual `root:/path` form so that messages
/// can be returned to clients without leaking the host layout.
#[derive(Debug, Error)]
pub enum FileError {
    /// The path resolves outside its root.
    #[error("path escapes its root: {0}")]
    Traversal(String),

    /// A file name is not a single plain path component.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// Nothing exists at the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The path exists but is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// The root directory itself cannot be removed.
    #[error("refusing to delete the {0} root")]
    RootRemoval(Root),

    /// Upload exceeds the configured limit.
    #[error("upload too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size of the rejected payload.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// Packaging a directory failed.
    #[error("packaging failed: {0}")]
    Packaging(String),

    /// The extraction capability reported a failure.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render a virtual path for messages and logs.
pub fn virtual_display(root: Root, path: &str) -> String {
    format!("{}:/{}", root, path.trim_start_matches(['/', '\\']))
}
