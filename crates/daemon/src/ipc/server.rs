//! IPC Server for handling client connections via Unix Domain Sockets.
//!
//! The server listens on a Unix socket and accepts connections from the CLI
//! (or any front-end), reading one request per line and answering with one
//! or more response lines.

use std::io;
use std::path::Path;

use protocol::{decode_line, encode_line, ProtocolError, Request, Response, MAX_LINE_SIZE};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// This will create the socket file and any necessary parent directories.
    /// If a socket file already exists at the path, it will be removed first.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self { listener })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client.
///
/// This struct wraps a Unix stream and provides methods for reading
/// requests and sending responses using the line protocol.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<Request>, IpcError> {
        match read_bounded_line(&mut self.reader).await? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &Response) -> Result<(), IpcError> {
        let bytes = encode_line(response)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Read one line of at most [`MAX_LINE_SIZE`] bytes.
///
/// Returns `None` on a clean end of stream.
pub(crate) async fn read_bounded_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>, IpcError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = MAX_LINE_SIZE as u64 + 1;
    let bytes_read = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut line)
        .await?;

    if bytes_read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge {
            size: line.len(),
            max: MAX_LINE_SIZE,
        }
        .into());
    }
    Ok(Some(line))
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl IpcError {
    /// Whether the connection can keep going after this error.
    ///
    /// A malformed line is answered with an error; oversize lines and I/O
    /// failures leave the stream in an unknown position.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            IpcError::Protocol(ProtocolError::Deserialization(_))
                | IpcError::Protocol(ProtocolError::Serialization(_))
        )
    }
}
