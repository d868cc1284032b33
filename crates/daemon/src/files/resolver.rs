//! Virtual path resolution against the two storage roots.
//!
//! A virtual path is a caller supplied, `/`-separated relative path. It is
//! joined to the root's base directory and normalized lexically; the result
//! must be the base directory itself or nested under it. When some prefix of
//! the result exists on disk, its symlink-resolved form must also stay under
//! the base, which catches links that point out of the root.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use protocol::Root;

use super::error::{virtual_display, FileError};

/// Base directories of both roots, created and canonicalized at startup.
#[derive(Debug, Clone)]
pub struct Roots {
    raw: PathBuf,
    extracted: PathBuf,
}

impl Roots {
    /// Create the base directories if needed and record their canonical form.
    pub fn prepare(raw: &Path, extracted: &Path) -> io::Result<Self> {
        fs::create_dir_all(raw)?;
        fs::create_dir_all(extracted)?;
        Ok(Self {
            raw: fs::canonicalize(raw)?,
            extracted: fs::canonicalize(extracted)?,
        })
    }

    /// Canonical base directory of a root.
    pub fn base(&self, root: Root) -> &Path {
        match root {
            Root::Raw => &self.raw,
            Root::Extracted => &self.extracted,
        }
    }
}

/// Resolves virtual paths to absolute host paths.
///
/// Resolution never touches the filesystem except to read symlinks, and it
/// does not require the target to exist.
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: Roots,
}

impl PathResolver {
    /// Create a resolver over prepared roots.
    pub fn new(roots: Roots) -> Self {
        Self { roots }
    }

    /// Canonical base directory of a root.
    pub fn base(&self, root: Root) -> &Path {
        self.roots.base(root)
    }

    /// Resolve a virtual path under a root.
    pub fn resolve(&self, root: Root, virtual_path: &str) -> Result<PathBuf, FileError> {
        let base = self.base(root);
        let traversal = || FileError::Traversal(virtual_display(root, virtual_path));

        let normalized = virtual_path.replace('\\', "/");
        if has_drive_prefix(&normalized) {
            return Err(traversal());
        }

        let mut resolved = base.to_path_buf();
        for component in Path::new(&normalized).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::RootDir | Component::Prefix(_) => return Err(traversal()),
            }
        }

        if !resolved.starts_with(base) {
            return Err(traversal());
        }
        if !existing_prefix_within(base, &resolved) {
            return Err(traversal());
        }

        Ok(resolved)
    }

    /// Resolve a virtual path without following a link in its last
    /// component.
    ///
    /// Used where the entry itself is acted on, so a link that points out of
    /// the root can still be removed by its own path.
    pub fn resolve_entry(&self, root: Root, virtual_path: &str) -> Result<PathBuf, FileError> {
        let err = match self.resolve(root, virtual_path) {
            Ok(path) => return Ok(path),
            Err(err) => err,
        };

        let normalized = virtual_path.replace('\\', "/");
        if normalized.starts_with('/') || has_drive_prefix(&normalized) {
            return Err(err);
        }
        let trimmed = normalized.trim_end_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        if matches!(name, "" | "." | "..") {
            return Err(err);
        }

        let dir = self.resolve(root, parent).map_err(|_| err)?;
        Ok(dir.join(name))
    }

    /// The `/`-separated virtual path of an absolute path under a root.
    pub fn relative(&self, root: Root, absolute: &Path) -> Result<String, FileError> {
        let relative = absolute
            .strip_prefix(self.base(root))
            .map_err(|_| FileError::Traversal(absolute.display().to_string()))?;

        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect();
        Ok(parts.join("/"))
    }

    /// Whether a resolved path is the base directory of its root.
    pub fn is_base(&self, root: Root, resolved: &Path) -> bool {
        resolved == self.base(root)
    }
}

/// `C:/...` style inputs are absolute on other platforms.
fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Canonicalize the deepest existing ancestor of `resolved` and check it.
fn existing_prefix_within(base: &Path, resolved: &Path) -> bool {
    let mut probe = resolved;
    loop {
        match fs::canonicalize(probe) {
            Ok(canonical) => return canonical.starts_with(base),
            Err(_) => match probe.parent() {
                Some(parent) if parent.starts_with(base) => probe = parent,
                _ => return true,
            },
        }
    }
}
