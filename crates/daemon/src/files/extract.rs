//! Archive extraction from the raw root into the extracted root.
//!
//! Decompression goes through the [`Extractor`] capability. The built in
//! [`NativeExtractor`] handles zip, tar, tar.gz and gz; formats it cannot read
//! are handed to an optional external command such as `7z`.

use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use protocol::Root;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::error::{virtual_display, FileError};
use super::resolver::PathResolver;

/// Archive formats recognised by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Rar,
    SevenZip,
    Tar,
    /// `.tar.gz` and `.tgz`.
    TarGz,
    /// A single gzip-compressed file.
    Gz,
}

impl ArchiveFormat {
    /// Detect the format from a file name.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        let ext = Path::new(&lower).extension()?.to_str()?.to_string();
        match ext.as_str() {
            "zip" => Some(Self::Zip),
            "rar" => Some(Self::Rar),
            "7z" => Some(Self::SevenZip),
            "tar" => Some(Self::Tar),
            "gz" => Some(Self::Gz),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Zip => "zip",
            Self::Rar => "rar",
            Self::SevenZip => "7z",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::Gz => "gz",
        };
        f.write_str(s)
    }
}

/// Capability that unpacks an archive into a directory.
pub trait Extractor: Send + Sync {
    /// Whether this extractor can handle the format.
    fn supports(&self, format: ArchiveFormat) -> bool;

    /// Unpack `archive` into the existing directory `dest`.
    fn extract(&self, archive: &Path, format: ArchiveFormat, dest: &Path) -> anyhow::Result<()>;
}

/// In-process extractor for zip, tar and gzip.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeExtractor;

impl NativeExtractor {
    fn extract_zip(archive: &Path, dest: &Path) -> anyhow::Result<()> {
        let file = File::open(archive).context("failed to open archive")?;
        let mut zip = ZipArchive::new(BufReader::new(file)).context("not a valid zip archive")?;

        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .with_context(|| format!("failed to read entry {}", index))?;
            let Some(relative) = entry.enclosed_name() else {
                warn!(name = %entry.name(), "Skipping zip entry with unsafe name");
                continue;
            };

            let (dir_part, file_name) = if entry.is_dir() {
                (relative.as_path(), None)
            } else {
                match relative.file_name() {
                    Some(name) => (relative.parent().unwrap_or(Path::new("")), Some(name)),
                    None => continue,
                }
            };

            let Some(dir) = create_contained_dirs(dest, dir_part)? else {
                warn!(name = %entry.name(), "Skipping zip entry behind a link leaving the destination");
                continue;
            };
            let Some(name) = file_name else {
                continue;
            };

            let mut out = create_contained_file(&dir, name)?;
            io::copy(&mut entry, &mut out)
                .with_context(|| format!("failed to write {}", dir.join(name).display()))?;
        }
        Ok(())
    }

    fn extract_tar<R: io::Read>(reader: R, dest: &Path) -> anyhow::Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_overwrite(true);
        archive.unpack(dest).context("failed to unpack tar archive")?;
        Ok(())
    }

    fn extract_gz(archive: &Path, dest: &Path) -> anyhow::Result<()> {
        let name = archive
            .file_stem()
            .context("archive has no file name")?;
        let file = File::open(archive).context("failed to open archive")?;
        let mut decoder = GzDecoder::new(BufReader::new(file));
        let mut out = create_contained_file(dest, name)?;
        io::copy(&mut decoder, &mut out).context("failed to decompress gzip stream")?;
        Ok(())
    }
}

impl Extractor for NativeExtractor {
    fn supports(&self, format: ArchiveFormat) -> bool {
        matches!(
            format,
            ArchiveFormat::Zip | ArchiveFormat::Tar | ArchiveFormat::TarGz | ArchiveFormat::Gz
        )
    }

    fn extract(&self, archive: &Path, format: ArchiveFormat, dest: &Path) -> anyhow::Result<()> {
        match format {
            ArchiveFormat::Zip => Self::extract_zip(archive, dest),
            ArchiveFormat::Tar => {
                let file = File::open(archive).context("failed to open archive")?;
                Self::extract_tar(BufReader::new(file), dest)
            }
            ArchiveFormat::TarGz => {
                let file = File::open(archive).context("failed to open archive")?;
                Self::extract_tar(GzDecoder::new(BufReader::new(file)), dest)
            }
            ArchiveFormat::Gz => Self::extract_gz(archive, dest),
            other => bail!("{} archives are not supported natively", other),
        }
    }
}

/// Extractor delegating to an external program.
///
/// Arguments may contain `{archive}` and `{dest}` placeholders.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExtractor {
    /// Create an extractor for an already located program.
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Look the program up on `PATH`.
    pub fn locate(command: &str, args: Vec<String>) -> Option<Self> {
        match which::which(command) {
            Ok(program) => Some(Self::new(program, args)),
            Err(e) => {
                warn!(command, error = %e, "External extractor not found");
                None
            }
        }
    }

    fn render_args(&self, archive: &Path, dest: &Path) -> Vec<String> {
        let archive = archive.to_string_lossy();
        let dest = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{archive}", &archive).replace("{dest}", &dest))
            .collect()
    }
}

impl Extractor for CommandExtractor {
    fn supports(&self, _format: ArchiveFormat) -> bool {
        true
    }

    fn extract(&self, archive: &Path, _format: ArchiveFormat, dest: &Path) -> anyhow::Result<()> {
        let args = self.render_args(archive, dest);
        debug!(program = %self.program.display(), ?args, "Running external extractor");

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(dest)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output");
            bail!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                detail.trim()
            );
        }
        Ok(())
    }
}

/// Native extraction with an optional external fallback.
pub struct DefaultExtractor {
    native: NativeExtractor,
    command: Option<CommandExtractor>,
}

impl DefaultExtractor {
    /// Create an extractor with an optional external command.
    pub fn new(command: Option<CommandExtractor>) -> Self {
        Self {
            native: NativeExtractor,
            command,
        }
    }
}

impl Extractor for DefaultExtractor {
    fn supports(&self, format: ArchiveFormat) -> bool {
        self.native.supports(format) || self.command.is_some()
    }

    fn extract(&self, archive: &Path, format: ArchiveFormat, dest: &Path) -> anyhow::Result<()> {
        if self.native.supports(format) {
            return self.native.extract(archive, format, dest);
        }
        match &self.command {
            Some(command) => command.extract(archive, format, dest),
            None => bail!("no extractor configured for {} archives", format),
        }
    }
}

/// Extracts archives from the raw root into the extracted root.
#[derive(Clone)]
pub struct ExtractionService {
    resolver: PathResolver,
    extractor: Arc<dyn Extractor>,
}

impl ExtractionService {
    /// Create a service using the given capability.
    pub fn new(resolver: PathResolver, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            resolver,
            extractor,
        }
    }

    /// Extract a raw archive into `extracted/<stem>`.
    ///
    /// The destination is reused if present. A failed extraction leaves
    /// whatever was already written in place.
    pub fn extract(&self, virtual_path: &str) -> Result<PathBuf, FileError> {
        let source = self.resolver.resolve(Root::Raw, virtual_path)?;
        if !source.is_file() {
            return Err(FileError::NotFound(virtual_display(Root::Raw, virtual_path)));
        }

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let format = ArchiveFormat::detect(&file_name).ok_or_else(|| {
            FileError::Extraction(format!("unsupported archive format: {}", file_name))
        })?;

        let dest_name = destination_name(&file_name);
        let dest = self.resolver.resolve(Root::Extracted, &dest_name)?;
        fs::create_dir_all(&dest)?;

        info!(
            source = %source.display(),
            dest = %dest.display(),
            format = %format,
            "Extracting archive"
        );
        self.extractor
            .extract(&source, format, &dest)
            .map_err(|e| {
                warn!(source = %source.display(), error = %e, "Extraction failed");
                FileError::Extraction(format!("{:#}", e))
            })?;

        Ok(dest)
    }
}

/// Create the directories of `relative` below `dest`.
///
/// Existing links are followed only while their target stays below `dest`.
/// Returns `None` when one leads elsewhere.
fn create_contained_dirs(dest: &Path, relative: &Path) -> anyhow::Result<Option<PathBuf>> {
    let root = fs::canonicalize(dest)
        .with_context(|| format!("failed to resolve {}", dest.display()))?;
    let mut current = root.clone();

    for component in relative.components() {
        let part = match component {
            Component::Normal(part) => part,
            Component::CurDir => continue,
            _ => return Ok(None),
        };
        let next = current.join(part);
        match fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = match fs::canonicalize(&next) {
                    Ok(target) => target,
                    Err(_) => return Ok(None),
                };
                if !target.starts_with(&root) || !target.is_dir() {
                    return Ok(None);
                }
                current = target;
            }
            Ok(meta) if meta.is_dir() => current = next,
            Ok(_) => bail!("{} is not a directory", next.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&next)
                    .with_context(|| format!("failed to create {}", next.display()))?;
                current = next;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to inspect {}", next.display()))
            }
        }
    }
    Ok(Some(current))
}

/// Create `name` in `dir`, replacing a link of that name instead of writing
/// through it.
fn create_contained_file(dir: &Path, name: &OsStr) -> anyhow::Result<File> {
    let target = dir.join(name);
    if let Ok(meta) = fs::symlink_metadata(&target) {
        if meta.file_type().is_symlink() {
            fs::remove_file(&target)
                .with_context(|| format!("failed to replace link {}", target.display()))?;
        }
    }
    File::create(&target).with_context(|| format!("failed to create {}", target.display()))
}

/// File name with its last extension removed.
fn destination_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() || stem == "." || stem == ".." {
        file_name.to_string()
    } else {
        stem
    }
}
