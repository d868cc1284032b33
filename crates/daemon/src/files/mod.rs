//! File components operating on the two storage roots.
//!
//! This module provides:
//! - Virtual path resolution with traversal protection
//! - Directory listings with presentation metadata
//! - Upload, download and delete through the file store
//! - Directory packaging as ZIP and archive extraction
//! - Disk usage reporting
//!
//! # Security
//!
//! Every path-bearing operation resolves its virtual path through
//! [`PathResolver`] before touching the filesystem. Paths that normalize
//! outside their root, absolute paths, and symlinks that lead out of a root
//! are rejected with [`FileError::Traversal`].

pub mod catalog;
pub mod disk;
pub mod error;
pub mod extract;
pub mod packager;
pub mod resolver;
pub mod store;

pub use catalog::{category_for, is_archive, DirectoryCatalog, ARCHIVE_EXTENSIONS};
pub use disk::{disk_usage, format_size, DiskUsage};
pub use error::FileError;
pub use extract::{
    ArchiveFormat, CommandExtractor, DefaultExtractor, ExtractionService, Extractor,
    NativeExtractor,
};
pub use packager::{sweep_scratch, ArchivePackager, PackagedArchive};
pub use resolver::{PathResolver, Roots};
pub use store::{validate_file_name, FileStore, OpenedFile};
