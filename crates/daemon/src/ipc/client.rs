//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! Most requests get exactly one response and go through [`IpcClient::send`].
//! Streaming requests (downloads, followed transfers) write the request with
//! [`IpcClient::write_request`] and read responses until a terminal one.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{decode_line, encode_line, Request, Response};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::server::{read_bounded_line, IpcError};

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// An error here typically indicates that the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for single-response operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its single response.
    pub async fn send(&mut self, request: Request) -> Result<Response, IpcError> {
        tokio::time::timeout(self.timeout, async {
            self.write_request(&request).await?;
            self.read_response().await
        })
        .await
        .map_err(|_| {
            IpcError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "operation timed out",
            ))
        })?
    }

    /// Write a request without waiting for a response.
    pub async fn write_request(&mut self, request: &Request) -> Result<(), IpcError> {
        let bytes = encode_line(request)?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the next response, without a timeout.
    pub async fn read_response(&mut self) -> Result<Response, IpcError> {
        match read_bounded_line(&mut self.reader).await? {
            Some(line) => Ok(decode_line(&line)?),
            None => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            ))),
        }
    }

    /// Send a ping request to check if the daemon is responsive.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(Request::Ping).await?;
        Ok(matches!(response, Response::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<Response, IpcError> {
        self.send(Request::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<Response, IpcError> {
        self.send(Request::Stop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = IpcClient::connect(&socket_path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, Request::Ping);
            conn.send_response(&Response::Pong).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_reads_stream() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            conn.read_request().await.unwrap().unwrap();
            for response in [
                Response::FileStart {
                    name: "a.txt".to_string(),
                    size: 3,
                },
                Response::FileChunk {
                    data: b"abc".to_vec(),
                },
                Response::FileEnd,
            ] {
                conn.send_response(&response).await.unwrap();
            }
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        client
            .write_request(&Request::Download {
                root: protocol::Root::Raw,
                path: "a.txt".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            client.read_response().await.unwrap(),
            Response::FileStart { size: 3, .. }
        ));
        assert_eq!(
            client.read_response().await.unwrap(),
            Response::FileChunk {
                data: b"abc".to_vec()
            }
        );
        assert_eq!(client.read_response().await.unwrap(), Response::FileEnd);

        server_handle.await.unwrap();
        assert!(client.read_response().await.is_err());
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let _request = conn.read_request().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();

        let result = client.ping().await;
        assert!(matches!(
            result,
            Err(IpcError::Io(ref e)) if e.kind() == io::ErrorKind::TimedOut
        ));

        server_handle.abort();
    }
}
