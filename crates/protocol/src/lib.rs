//! # Fetchbox Protocol Library
//!
//! Wire types shared by the Fetchbox daemon and its command line client.
//!
//! ## Overview
//!
//! - **Message Definitions**: requests, responses and the listing metadata
//!   they carry
//! - **Line Framing**: one JSON document per line over the control socket
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_line, encode_line, Request, Root};
//!
//! let request = Request::List { root: Root::Raw, path: "movies".into() };
//! let bytes = encode_line(&request).unwrap();
//! let back: Request = decode_line(&bytes).unwrap();
//! assert_eq!(back, request);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`framing`]: Line codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{decode_line, encode_line, LINE_DELIMITER, MAX_LINE_SIZE, MAX_UPLOAD_PAYLOAD};
pub use messages::{
    Category, Entry, EntryKind, ErrorCode, Request, Response, Root, TransferMode, TransferState,
    TransferSummary, UploadFile, PROTOCOL_VERSION,
};
