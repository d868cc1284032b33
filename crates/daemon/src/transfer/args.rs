//! Command line contract of the download utility.

use std::path::Path;

use crate::config::TransferConfig;

/// Fixed arguments followed by the input.
///
/// The utility writes into `raw_dir`, stops seeding as soon as the payload is
/// complete, prints a progress summary every `summary_interval` seconds and
/// preallocates nothing.
pub fn transfer_args(config: &TransferConfig, raw_dir: &Path, input: &str) -> Vec<String> {
    let mut args = vec![
        format!("--dir={}", raw_dir.display()),
        "--seed-time=0".to_string(),
        format!("--summary-interval={}", config.summary_interval),
        format!(
            "--max-connection-per-server={}",
            config.max_connections_per_server
        ),
        "--file-allocation=none".to_string(),
        format!("--disk-cache={}", config.disk_cache),
        "--allow-overwrite=true".to_string(),
    ];
    if !config.trackers.is_empty() {
        args.push(format!("--bt-tracker={}", config.trackers.join(",")));
    }
    args.push(input.to_string());
    args
}

/// Whether the input carries a URI scheme such as `magnet:` or `https:`.
pub fn has_uri_scheme(input: &str) -> bool {
    let Some((scheme, _)) = input.split_once(':') else {
        return false;
    };
    scheme.len() > 1
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
