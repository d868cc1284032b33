//! Line framing for the control socket.
//!
//! # Frame Format
//!
//! Each frame is a single JSON document followed by `\n`. JSON encoding never
//! emits a raw newline inside a document, so the delimiter is unambiguous.
//! Binary payloads are carried as base64 strings inside the document.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Frame delimiter.
pub const LINE_DELIMITER: u8 = b'\n';

/// Maximum encoded line size (64 MB).
pub const MAX_LINE_SIZE: usize = 64 * 1024 * 1024;

/// Room kept for the JSON envelope around an inline payload.
const ENVELOPE_RESERVE: usize = 64 * 1024;

/// Largest file an upload request can carry inline.
///
/// Upload requests send their files as base64 inside one line, so a payload
/// grows by a third on the wire.
pub const MAX_UPLOAD_PAYLOAD: u64 = ((MAX_LINE_SIZE - ENVELOPE_RESERVE) / 4 * 3) as u64;

/// Encode a message as one newline-terminated JSON line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut bytes =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if bytes.len() + 1 > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge {
            size: bytes.len() + 1,
            max: MAX_LINE_SIZE,
        });
    }
    bytes.push(LINE_DELIMITER);
    Ok(bytes)
}

/// Decode one line, with or without its trailing delimiter.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        });
    }
    let trimmed = trim_line(line);
    if trimmed.is_empty() {
        return Err(ProtocolError::Deserialization("empty line".to_string()));
    }
    Ok(serde_json::from_slice(trimmed)?)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request, Response, Root, UploadFile};

    #[test]
    fn test_encode_appends_single_delimiter() {
        let bytes = encode_line(&Request::Ping).unwrap();
        assert_eq!(bytes.last(), Some(&LINE_DELIMITER));
        assert_eq!(bytes.iter().filter(|b| **b == LINE_DELIMITER).count(), 1);
    }

    #[test]
    fn test_decode_accepts_crlf() {
        let parsed: Request = decode_line(b"{\"type\":\"Status\"}\r\n").unwrap();
        assert_eq!(parsed, Request::Status);
    }

    #[test]
    fn test_newlines_in_strings_stay_escaped() {
        let response = Response::TransferLine {
            line: "first\nsecond".to_string(),
        };
        let bytes = encode_line(&response).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == LINE_DELIMITER).count(), 1);

        let parsed: Response = decode_line(&bytes).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_decode_empty_line() {
        let result: Result<Request> = decode_line(b"\n");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_unknown_variant() {
        let result: Result<Request> = decode_line(b"{\"type\":\"Reboot\"}");
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_list_request() {
        let line = br#"{"type":"List","data":{"root":"raw","path":"a/b"}}"#;
        let parsed: Request = decode_line(line).unwrap();
        assert_eq!(
            parsed,
            Request::List {
                root: Root::Raw,
                path: "a/b".to_string()
            }
        );
    }

    #[test]
    fn test_largest_upload_fits_one_line() {
        let request = Request::Upload {
            path: "incoming/with/a/fairly/deep/path".to_string(),
            files: vec![UploadFile {
                name: format!("{}.iso", "n".repeat(251)),
                data: vec![0xFF; MAX_UPLOAD_PAYLOAD as usize],
            }],
        };
        let bytes = encode_line(&request).unwrap();
        assert!(bytes.len() <= MAX_LINE_SIZE);

        let parsed: Request = decode_line(&bytes).unwrap();
        assert_eq!(parsed.name(), "Upload");
    }
}
