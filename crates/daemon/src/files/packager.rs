//! Packages a directory subtree as a ZIP archive for download.
//!
//! Archives are built in the scratch directory and removed as soon as the
//! returned [`PackagedArchive`] is dropped.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use protocol::Root;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error::{virtual_display, FileError};
use super::resolver::PathResolver;

/// Entries at or above this size need ZIP64 headers.
const LARGE_FILE_THRESHOLD: u64 = u32::MAX as u64;

/// A finished archive living in the scratch directory.
#[derive(Debug)]
pub struct PackagedArchive {
    file: NamedTempFile,
    name: String,
    size: u64,
}

impl PackagedArchive {
    /// Suggested download name, `<directory>.zip`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Location of the archive in scratch.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Open a fresh read handle positioned at the start.
    pub fn open(&self) -> io::Result<File> {
        self.file.reopen()
    }
}

/// Builds ZIP archives of directories under the roots.
#[derive(Debug, Clone)]
pub struct ArchivePackager {
    resolver: PathResolver,
    scratch_dir: PathBuf,
}

impl ArchivePackager {
    /// Create a packager writing into `scratch_dir`.
    pub fn new(resolver: PathResolver, scratch_dir: PathBuf) -> Self {
        Self {
            resolver,
            scratch_dir,
        }
    }

    /// Package a directory with all of its contents.
    pub fn package(&self, root: Root, virtual_path: &str) -> Result<PackagedArchive, FileError> {
        let dir = self.resolver.resolve(root, virtual_path)?;
        if !dir.is_dir() {
            return Err(FileError::NotFound(virtual_display(root, virtual_path)));
        }

        let stem = if self.resolver.is_base(root, &dir) {
            root.name().to_string()
        } else {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| root.name().to_string())
        };
        let name = format!("{}.zip", stem);

        let file = NamedTempFile::with_prefix_in("package-", &self.scratch_dir)?;
        write_archive(&dir, self.resolver.base(root), &file).map_err(|e| {
            warn!(dir = %dir.display(), error = %e, "Packaging failed");
            FileError::Packaging(format!("{:#}", e))
        })?;
        let size = file.as_file().metadata()?.len();

        info!(root = %root, dir = %dir.display(), name = %name, size, "Packaged directory");
        Ok(PackagedArchive { file, name, size })
    }
}

/// Write every file and directory below `source` into `target`.
///
/// Links are followed as long as their target stays under `base`; links
/// that leave it, dangle or loop are skipped.
fn write_archive(source: &Path, base: &Path, target: &NamedTempFile) -> anyhow::Result<()> {
    let handle = target
        .as_file()
        .try_clone()
        .context("failed to open archive for writing")?;
    let mut writer = ZipWriter::new(BufWriter::new(handle));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut walker = WalkDir::new(source)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_skippable(&e) => {
                debug!(error = %e, "Skipping unreachable entry");
                continue;
            }
            Err(e) => return Err(e).context("failed to walk directory"),
        };
        let file_type = entry.file_type();

        if entry.path_is_symlink() && !link_within(entry.path(), base) {
            debug!(path = %entry.path().display(), "Skipping link leading out of the root");
            if file_type.is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .context("entry outside packaged directory")?;
        let name = archive_name(relative);

        if file_type.is_dir() {
            writer
                .add_directory(name.as_str(), options.unix_permissions(0o755))
                .with_context(|| format!("failed to add directory {}", name))?;
        } else if file_type.is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            writer
                .start_file(
                    name.as_str(),
                    options.large_file(len >= LARGE_FILE_THRESHOLD),
                )
                .with_context(|| format!("failed to add file {}", name))?;
            let mut input = File::open(entry.path())
                .with_context(|| format!("failed to read {}", entry.path().display()))?;
            io::copy(&mut input, &mut writer)
                .with_context(|| format!("failed to compress {}", name))?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular entry");
        }
    }

    let mut inner = writer.finish().context("failed to finish archive")?;
    inner.flush().context("failed to flush archive")?;
    Ok(())
}

/// Link loops and dangling links.
fn is_skippable(error: &walkdir::Error) -> bool {
    error.loop_ancestor().is_some()
        || error
            .io_error()
            .map(|e| e.kind() == io::ErrorKind::NotFound)
            .unwrap_or(false)
}

/// Whether a link resolves to somewhere under `base`.
fn link_within(path: &Path, base: &Path) -> bool {
    fs::canonicalize(path)
        .map(|target| target.starts_with(base))
        .unwrap_or(false)
}

/// ZIP entry names always use `/`.
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Remove leftovers from previous runs.
pub fn sweep_scratch(scratch_dir: &Path) -> io::Result<usize> {
    if !scratch_dir.exists() {
        fs::create_dir_all(scratch_dir)?;
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(scratch_dir)? {
        let path = entry?.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch file"),
        }
    }
    Ok(removed)
}
