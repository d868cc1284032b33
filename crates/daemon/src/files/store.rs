//! Upload, read and delete operations scoped to the roots.
//!
//! Uploads are written to a temporary file in the scratch directory first and
//! then moved into place, so a reader never observes a half-written file.

use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use protocol::Root;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::error::{virtual_display, FileError};
use super::resolver::PathResolver;

/// Mode given to uploaded files.
const UPLOAD_MODE: u32 = 0o644;

/// A file opened for streaming to a caller.
#[derive(Debug)]
pub struct OpenedFile {
    /// Open handle positioned at the start.
    pub file: File,
    /// File name.
    pub name: String,
    /// Size in bytes at open time.
    pub size: u64,
}

/// Check that an upload name is a single plain path component.
pub fn validate_file_name(name: &str) -> Result<(), FileError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(FileError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// File store over both roots.
#[derive(Debug, Clone)]
pub struct FileStore {
    resolver: PathResolver,
    scratch_dir: PathBuf,
    max_upload_size: u64,
}

impl FileStore {
    /// Create a store that stages uploads in `scratch_dir`.
    pub fn new(resolver: PathResolver, scratch_dir: PathBuf, max_upload_size: u64) -> Self {
        Self {
            resolver,
            scratch_dir,
            max_upload_size,
        }
    }

    /// Write `bytes` as `file_name` inside an existing directory.
    ///
    /// An existing file with the same name is replaced.
    pub fn save(
        &self,
        root: Root,
        dir_path: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, FileError> {
        validate_file_name(file_name)?;

        let size = bytes.len() as u64;
        if size > self.max_upload_size {
            return Err(FileError::TooLarge {
                size,
                limit: self.max_upload_size,
            });
        }

        let dir = self.resolver.resolve(root, dir_path)?;
        if !dir.is_dir() {
            return Err(FileError::NotFound(virtual_display(root, dir_path)));
        }
        let destination = dir.join(file_name);

        let mut staged = NamedTempFile::new_in(&self.scratch_dir)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;
        staged
            .as_file()
            .set_permissions(Permissions::from_mode(UPLOAD_MODE))?;

        place(staged, &dir, &destination)?;

        info!(
            root = %root,
            path = %destination.display(),
            size,
            "Stored upload"
        );
        Ok(destination)
    }

    /// Open a regular file for reading.
    pub fn open(&self, root: Root, virtual_path: &str) -> Result<OpenedFile, FileError> {
        let path = self.resolver.resolve(root, virtual_path)?;
        let metadata = fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(virtual_display(root, virtual_path)),
            _ => FileError::Io(e),
        })?;
        if !metadata.is_file() {
            return Err(FileError::NotAFile(virtual_display(root, virtual_path)));
        }

        let file = File::open(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.name().to_string());

        Ok(OpenedFile {
            file,
            name,
            size: metadata.len(),
        })
    }

    /// Delete a file, or a directory with everything below it.
    ///
    /// A link is removed itself, never the entry it points to.
    pub fn delete(&self, root: Root, virtual_path: &str) -> Result<(), FileError> {
        let path = self.resolver.resolve_entry(root, virtual_path)?;
        if self.resolver.is_base(root, &path) {
            return Err(FileError::RootRemoval(root));
        }

        let not_found = || FileError::NotFound(virtual_display(root, virtual_path));
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(FileError::Io(e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                info!(root = %root, path = %path.display(), "Deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(FileError::Io(e)),
        }
    }
}

/// Move a staged file to its destination.
///
/// A rename fails when scratch and destination live on different
/// filesystems; the content is then copied next to the destination first so
/// the final step is still a rename.
fn place(staged: NamedTempFile, dir: &Path, destination: &Path) -> Result<(), FileError> {
    let err = match staged.persist(destination) {
        Ok(_) => return Ok(()),
        Err(err) => err,
    };
    debug!(
        path = %destination.display(),
        error = %err.error,
        "Rename from scratch failed, copying"
    );

    let mut source = err.file.reopen()?;
    let mut local = NamedTempFile::new_in(dir)?;
    io::copy(&mut source, &mut local)?;
    local
        .as_file()
        .set_permissions(Permissions::from_mode(UPLOAD_MODE))?;
    local
        .persist(destination)
        .map_err(|e| FileError::Io(e.error))?;
    Ok(())
}
