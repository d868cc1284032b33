//! Directory listing with presentation metadata.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use protocol::{Category, Entry, EntryKind, Root};
use tracing::debug;

use super::error::{virtual_display, FileError};
use super::resolver::PathResolver;

/// Extensions the extraction service accepts.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz"];

const CATEGORY_TABLE: &[(Category, &[&str])] = &[
    (
        Category::Archive,
        &["zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz"],
    ),
    (Category::Torrent, &["torrent", "metalink", "meta4"]),
    (
        Category::Video,
        &[
            "mp4", "mkv", "avi", "mov", "wmv", "webm", "m4v", "flv", "mpg", "mpeg", "ts",
        ],
    ),
    (
        Category::Audio,
        &["mp3", "flac", "wav", "ogg", "m4a", "aac", "opus", "wma"],
    ),
    (
        Category::Image,
        &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tiff"],
    ),
    (
        Category::Document,
        &[
            "pdf", "txt", "md", "doc", "docx", "odt", "epub", "rtf", "nfo", "srt",
        ],
    ),
];

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

/// Presentation category of a file name, `Other` when unknown.
pub fn category_for(name: &str) -> Category {
    let Some(ext) = extension(name) else {
        return Category::Other;
    };
    CATEGORY_TABLE
        .iter()
        .find(|(_, extensions)| extensions.contains(&ext.as_str()))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Other)
}

/// Whether a file name can be handed to extraction.
pub fn is_archive(name: &str) -> bool {
    extension(name)
        .map(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Directories first, newest first, then by name.
fn listing_order(a: &Entry, b: &Entry) -> Ordering {
    let a_dir = a.kind == EntryKind::Directory;
    let b_dir = b.kind == EntryKind::Directory;
    b_dir
        .cmp(&a_dir)
        .then_with(|| b.modified.cmp(&a.modified))
        .then_with(|| a.name.cmp(&b.name))
}

/// Lists directories under a root.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    resolver: PathResolver,
}

impl DirectoryCatalog {
    /// Create a catalog over a resolver.
    pub fn new(resolver: PathResolver) -> Self {
        Self { resolver }
    }

    /// List the immediate children of a directory.
    ///
    /// Entries that cannot be inspected, and anything that is neither a
    /// regular file nor a directory after following symlinks, are skipped.
    pub fn list(&self, root: Root, virtual_path: &str) -> Result<Vec<Entry>, FileError> {
        let dir = self.resolver.resolve(root, virtual_path)?;
        let not_found = || FileError::NotFound(virtual_display(root, virtual_path));

        match fs::metadata(&dir) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(not_found()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(FileError::Io(e)),
        }

        let mut entries = Vec::new();
        for entry_result in fs::read_dir(&dir)? {
            let entry = match entry_result {
                Ok(e) => e,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();

            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping entry without metadata");
                    continue;
                }
            };

            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else if metadata.is_file() {
                EntryKind::File
            } else {
                continue;
            };

            let relative_path = match self.resolver.relative(root, &path) {
                Ok(p) => p,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping entry outside root");
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            let (size, category, archive) = match kind {
                EntryKind::File => (Some(metadata.len()), category_for(&name), is_archive(&name)),
                EntryKind::Directory => (None, Category::Other, false),
            };

            entries.push(Entry {
                name,
                kind,
                size,
                modified: unix_seconds(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
                category,
                is_archive: archive,
                relative_path,
            });
        }

        entries.sort_by(listing_order);
        Ok(entries)
    }
}
