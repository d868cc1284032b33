//! Request and response definitions for Fetchbox.
//!
//! Every message travels as one JSON object per line. Requests and responses
//! are adjacently tagged (`{"type": "...", "data": {...}}`) so that new
//! variants can be added without breaking older clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// One of the two storage areas a path can be interpreted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Root {
    /// Raw downloads: uploads and download utility output.
    Raw,
    /// Extracted archives.
    Extracted,
}

impl Root {
    /// Both roots, in display order.
    pub const ALL: [Root; 2] = [Root::Raw, Root::Extracted];

    /// Wire name of the root.
    pub fn name(self) -> &'static str {
        match self {
            Root::Raw => "raw",
            Root::Extracted => "extracted",
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Root {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "downloads" => Ok(Root::Raw),
            "extracted" => Ok(Root::Extracted),
            other => Err(format!("unknown root: {}", other)),
        }
    }
}

/// Kind of a listing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// Presentation category derived from a file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Archive,
    /// Descriptor files accepted by the download utility.
    Torrent,
    Video,
    Audio,
    Image,
    Document,
    Other,
}

/// A single row of directory listing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes; `None` for directories.
    pub size: Option<u64>,
    /// Last modified timestamp (Unix epoch seconds).
    pub modified: u64,
    /// Presentation category.
    pub category: Category,
    /// Whether the entry can be handed to extraction.
    pub is_archive: bool,
    /// Path relative to the root, `/`-separated.
    pub relative_path: String,
}

/// A named file payload carried by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    /// Destination file name, used verbatim.
    pub name: String,
    /// File contents.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Running,
    Succeeded,
    Failed,
}

impl TransferState {
    /// Whether the transfer has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransferState::Running)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Running => "running",
            TransferState::Succeeded => "succeeded",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How the caller of `StartTransfer` wants to observe the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Block until the transfer finishes and return the full log.
    Wait,
    /// Stream each output line as it is produced, then the result.
    #[default]
    Follow,
    /// Return immediately after launch; observe with `PollTransfer`.
    Detach,
}

/// Short description of a transfer for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    /// Transfer identifier.
    pub id: String,
    /// Input as given by the caller.
    pub input: String,
    /// Current state.
    pub state: TransferState,
    /// Exit code once the process has exited normally.
    pub exit_code: Option<i32>,
    /// Number of log lines captured so far.
    pub lines: usize,
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or unsupported request.
    InvalidRequest,
    /// Path escapes its root.
    Traversal,
    /// Target does not exist.
    NotFound,
    /// A transfer is already running.
    AlreadyRunning,
    /// Directory packaging failed.
    PackagingFailed,
    /// The extraction capability reported a failure.
    ExtractionFailed,
    /// Generic filesystem failure.
    Io,
    /// Unexpected daemon failure.
    Internal,
}

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    /// Check if the daemon is alive.
    Ping,
    /// Daemon status.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List a directory.
    List {
        root: Root,
        #[serde(default)]
        path: String,
    },
    /// Upload files into a directory of the raw root.
    Upload {
        #[serde(default)]
        path: String,
        files: Vec<UploadFile>,
    },
    /// Download a single file.
    Download { root: Root, path: String },
    /// Download a directory packaged as a ZIP archive.
    Package {
        root: Root,
        #[serde(default)]
        path: String,
    },
    /// Delete a file or a directory tree.
    Delete { root: Root, path: String },
    /// Extract an archive of the raw root into the extracted root.
    Extract { path: String },
    /// Disk usage of the raw root's filesystem.
    DiskUsage,
    /// Launch the download utility.
    StartTransfer {
        input: String,
        #[serde(default)]
        mode: TransferMode,
    },
    /// Fetch transfer output after a line cursor.
    PollTransfer {
        id: String,
        #[serde(default)]
        from: usize,
    },
}

impl Request {
    /// Variant name, for logging without payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Status => "Status",
            Request::Stop => "Stop",
            Request::List { .. } => "List",
            Request::Upload { .. } => "Upload",
            Request::Download { .. } => "Download",
            Request::Package { .. } => "Package",
            Request::Delete { .. } => "Delete",
            Request::Extract { .. } => "Extract",
            Request::DiskUsage => "DiskUsage",
            Request::StartTransfer { .. } => "StartTransfer",
            Request::PollTransfer { .. } => "PollTransfer",
        }
    }
}

/// Responses sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Protocol version spoken by the daemon.
        version: u8,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Latest transfer, if any.
        transfer: Option<TransferSummary>,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// Generic success.
    Ok,
    /// Directory listing.
    Listing {
        root: Root,
        path: String,
        entries: Vec<Entry>,
    },
    /// Start of a byte stream.
    FileStart { name: String, size: u64 },
    /// A chunk of a byte stream.
    FileChunk {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// End of a byte stream.
    FileEnd,
    /// Disk usage with human readable sizes.
    DiskUsage {
        total: String,
        free: String,
        used_percent: f64,
    },
    /// A transfer was launched.
    TransferStarted { id: String },
    /// One line of transfer output.
    TransferLine { line: String },
    /// Terminal result of a transfer.
    TransferResult {
        id: String,
        state: TransferState,
        exit_code: Option<i32>,
        log: Vec<String>,
    },
    /// Output collected since a poll cursor.
    TransferProgress {
        id: String,
        state: TransferState,
        lines: Vec<String>,
        /// Cursor to pass as `from` on the next poll.
        next: usize,
    },
    /// An error occurred processing the request.
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Build an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_from_str() {
        assert_eq!("raw".parse::<Root>().unwrap(), Root::Raw);
        assert_eq!("downloads".parse::<Root>().unwrap(), Root::Raw);
        assert_eq!("Extracted".parse::<Root>().unwrap(), Root::Extracted);
        assert!("etc".parse::<Root>().is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let request = Request::List {
            root: Root::Extracted,
            path: "movies".to_string(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"type":"List","data":{"root":"extracted","path":"movies"}}"#
        );
    }

    #[test]
    fn test_unit_request_wire_format() {
        let json = serde_json::to_string(&Request::Ping).unwrap();
        assert_eq!(json, r#"{"type":"Ping"}"#);
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Request::Ping);
    }

    #[test]
    fn test_list_path_defaults_to_root() {
        let parsed: Request =
            serde_json::from_str(r#"{"type":"List","data":{"root":"raw"}}"#).unwrap();
        assert_eq!(
            parsed,
            Request::List {
                root: Root::Raw,
                path: String::new()
            }
        );
    }

    #[test]
    fn test_start_transfer_mode_defaults_to_follow() {
        let parsed: Request =
            serde_json::from_str(r#"{"type":"StartTransfer","data":{"input":"magnet:?xt=1"}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            Request::StartTransfer {
                input: "magnet:?xt=1".to_string(),
                mode: TransferMode::Follow
            }
        );
    }

    #[test]
    fn test_upload_payload_is_base64() {
        let file = UploadFile {
            name: "a.txt".to_string(),
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");

        let back: UploadFile = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, b"hello");
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<UploadFile, _> =
            serde_json::from_str(r#"{"name":"a","data":"***"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_directory_entry_size_is_null() {
        let entry = Entry {
            name: "report".to_string(),
            kind: EntryKind::Directory,
            size: None,
            modified: 1_700_000_000,
            category: Category::Other,
            is_archive: false,
            relative_path: "report".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "directory");
        assert!(json["size"].is_null());
    }

    #[test]
    fn test_error_code_wire_names() {
        let response = Response::error(ErrorCode::AlreadyRunning, "busy");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""code":"already_running""#));
    }

    #[test]
    fn test_transfer_state_terminal() {
        assert!(!TransferState::Running.is_terminal());
        assert!(TransferState::Succeeded.is_terminal());
        assert!(TransferState::Failed.is_terminal());
    }

    #[test]
    fn test_request_name_omits_payload() {
        let request = Request::Upload {
            path: String::new(),
            files: vec![UploadFile {
                name: "big.iso".to_string(),
                data: vec![0; 16],
            }],
        };
        assert_eq!(request.name(), "Upload");
        assert_eq!(Request::DiskUsage.name(), "DiskUsage");
    }
}
