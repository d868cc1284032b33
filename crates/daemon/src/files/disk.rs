//! Filesystem usage of the storage roots.

use std::path::Path;

use nix::sys::statvfs::statvfs;

use super::error::FileError;

/// Byte counts for one filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Total capacity.
    pub total: u64,
    /// Space available to unprivileged users.
    pub free: u64,
    /// Space in use.
    pub used: u64,
}

impl DiskUsage {
    /// Percentage of capacity in use, rounded to one decimal.
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let percent = self.used as f64 / self.total as f64 * 100.0;
        (percent * 10.0).round() / 10.0
    }
}

/// Query the filesystem holding `path`.
pub fn disk_usage(path: &Path) -> Result<DiskUsage, FileError> {
    let stat = statvfs(path).map_err(|errno| FileError::Io(errno.into()))?;
    let fragment = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;

    Ok(DiskUsage {
        total: blocks * fragment,
        free: stat.blocks_available() as u64 * fragment,
        used: blocks.saturating_sub(stat.blocks_free() as u64) * fragment,
    })
}

/// Human readable size with binary units, e.g. `931.5 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_size(1_000_204_886_016), "931.5 GiB");
    }

    #[test]
    fn test_used_percent() {
        let usage = DiskUsage {
            total: 1000,
            free: 600,
            used: 333,
        };
        assert_eq!(usage.used_percent(), 33.3);

        let empty = DiskUsage {
            total: 0,
            free: 0,
            used: 0,
        };
        assert_eq!(empty.used_percent(), 0.0);
    }

    #[test]
    fn test_disk_usage_of_temp_dir() {
        let temp = TempDir::new().unwrap();
        let usage = disk_usage(temp.path()).unwrap();

        assert!(usage.total > 0);
        assert!(usage.free <= usage.total);
        assert!(usage.used <= usage.total);
    }

    #[test]
    fn test_disk_usage_missing_path() {
        let result = disk_usage(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(FileError::Io(_))));
    }
}
