//! Request router for dispatching client requests to the file and transfer
//! components.
//!
//! Every request produces at least one response. Component errors never
//! escape the router: they are converted into `Response::Error` with a
//! machine-readable code. Only a failure to write to the client ends the
//! request early.

use std::sync::Arc;
use std::time::Instant;

use protocol::{
    ErrorCode, Request, Response, Root, TransferMode, UploadFile, PROTOCOL_VERSION,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::{
    disk_usage, format_size, validate_file_name, ArchivePackager, CommandExtractor,
    DefaultExtractor, DirectoryCatalog, ExtractionService, Extractor, FileError, FileStore,
    PathResolver,
};
use crate::ipc::{IpcConnection, IpcError};
use crate::transfer::{TransferError, TransferSupervisor};

/// Size of each streamed file chunk (64KB).
pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Result type for router operations.
pub type RouterResult = Result<(), RouterError>;

/// Errors that can occur during request routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// File operation error.
    #[error(transparent)]
    File(#[from] FileError),

    /// Transfer error.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Writing to the client failed.
    #[error("failed to send response: {0}")]
    Sink(#[from] IpcError),
}

fn file_error_code(err: &FileError) -> ErrorCode {
    match err {
        FileError::Traversal(_) | FileError::InvalidName(_) => ErrorCode::Traversal,
        FileError::NotFound(_) | FileError::NotADirectory(_) => ErrorCode::NotFound,
        FileError::NotAFile(_) | FileError::RootRemoval(_) | FileError::TooLarge { .. } => {
            ErrorCode::InvalidRequest
        }
        FileError::Packaging(_) => ErrorCode::PackagingFailed,
        FileError::Extraction(_) => ErrorCode::ExtractionFailed,
        FileError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::NotFound,
        FileError::Io(_) => ErrorCode::Io,
    }
}

impl RouterError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouterError::File(e) => file_error_code(e),
            RouterError::Transfer(e) => match e {
                TransferError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
                TransferError::InvalidInput(_) => ErrorCode::InvalidRequest,
                TransferError::Path(f) => file_error_code(f),
                TransferError::NotFound(_) => ErrorCode::NotFound,
            },
            RouterError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RouterError::Internal(_) => ErrorCode::Internal,
            RouterError::Sink(_) => ErrorCode::Io,
        }
    }

    /// Convert the error to a protocol error response.
    pub fn to_error_response(&self) -> Response {
        Response::error(self.code(), self.to_string())
    }
}

/// Destination for the responses of one request.
#[allow(async_fn_in_trait)]
pub trait ResponseSink {
    /// Deliver one response.
    async fn send(&mut self, response: Response) -> Result<(), IpcError>;
}

impl ResponseSink for IpcConnection {
    async fn send(&mut self, response: Response) -> Result<(), IpcError> {
        self.send_response(&response).await
    }
}

impl ResponseSink for Vec<Response> {
    async fn send(&mut self, response: Response) -> Result<(), IpcError> {
        self.push(response);
        Ok(())
    }
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, RouterError>
where
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RouterError::Internal(format!("blocking task failed: {}", e)))?
        .map_err(RouterError::from)
}

/// Request router that dispatches requests to the daemon components.
pub struct MessageRouter {
    resolver: PathResolver,
    catalog: DirectoryCatalog,
    store: FileStore,
    packager: ArchivePackager,
    extraction: ExtractionService,
    transfers: Arc<TransferSupervisor>,
    started_at: Instant,
}

impl MessageRouter {
    /// Build the components for prepared storage.
    pub fn new(config: &Config, resolver: PathResolver) -> Self {
        let scratch_dir = config.scratch_dir();

        let command = config
            .extract
            .command
            .as_deref()
            .and_then(|command| CommandExtractor::locate(command, config.extract.args.clone()));
        let extractor: Arc<dyn Extractor> = Arc::new(DefaultExtractor::new(command));

        Self {
            catalog: DirectoryCatalog::new(resolver.clone()),
            store: FileStore::new(
                resolver.clone(),
                scratch_dir.clone(),
                config.storage.max_upload_size,
            ),
            packager: ArchivePackager::new(resolver.clone(), scratch_dir),
            extraction: ExtractionService::new(resolver.clone(), extractor),
            transfers: Arc::new(TransferSupervisor::new(
                config.transfer.clone(),
                resolver.clone(),
            )),
            resolver,
            started_at: Instant::now(),
        }
    }

    /// The transfer supervisor.
    pub fn transfers(&self) -> &Arc<TransferSupervisor> {
        &self.transfers
    }

    /// Handle a request, converting component errors into error responses.
    ///
    /// Returns an error only when the sink itself fails.
    pub async fn dispatch<W: ResponseSink>(
        &self,
        request: Request,
        sink: &mut W,
    ) -> Result<(), IpcError> {
        match self.route(request, sink).await {
            Ok(()) => Ok(()),
            Err(RouterError::Sink(e)) => Err(e),
            Err(e) => {
                debug!(error = %e, code = ?e.code(), "Request failed");
                sink.send(e.to_error_response()).await
            }
        }
    }

    /// Route a request to its handler.
    pub async fn route<W: ResponseSink>(&self, request: Request, sink: &mut W) -> RouterResult {
        debug!(request = request.name(), "Routing request");

        match request {
            Request::Ping => Ok(sink.send(Response::Pong).await?),
            Request::Status => self.handle_status(sink).await,
            Request::Stop => Ok(sink.send(Response::Stopping).await?),
            Request::List { root, path } => self.handle_list(root, path, sink).await,
            Request::Upload { path, files } => self.handle_upload(path, files, sink).await,
            Request::Download { root, path } => self.handle_download(root, path, sink).await,
            Request::Package { root, path } => self.handle_package(root, path, sink).await,
            Request::Delete { root, path } => self.handle_delete(root, path, sink).await,
            Request::Extract { path } => self.handle_extract(path, sink).await,
            Request::DiskUsage => self.handle_disk_usage(sink).await,
            Request::StartTransfer { input, mode } => {
                self.handle_start_transfer(input, mode, sink).await
            }
            Request::PollTransfer { id, from } => self.handle_poll(id, from, sink).await,
        }
    }

    async fn handle_status<W: ResponseSink>(&self, sink: &mut W) -> RouterResult {
        let transfer = self.transfers.current().map(|t| t.summary());
        sink.send(Response::Status {
            version: PROTOCOL_VERSION,
            uptime_secs: self.started_at.elapsed().as_secs(),
            transfer,
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // File Handlers
    // =========================================================================

    async fn handle_list<W: ResponseSink>(
        &self,
        root: Root,
        path: String,
        sink: &mut W,
    ) -> RouterResult {
        let catalog = self.catalog.clone();
        let virtual_path = path.clone();
        let entries = blocking(move || catalog.list(root, &virtual_path)).await?;

        sink.send(Response::Listing {
            root,
            path,
            entries,
        })
        .await?;
        Ok(())
    }

    async fn handle_upload<W: ResponseSink>(
        &self,
        path: String,
        files: Vec<UploadFile>,
        sink: &mut W,
    ) -> RouterResult {
        if files.is_empty() {
            return Err(RouterError::InvalidRequest(
                "upload contains no files".to_string(),
            ));
        }
        for file in &files {
            validate_file_name(&file.name)?;
        }

        let store = self.store.clone();
        let count = files.len();
        blocking(move || {
            for file in files {
                store.save(Root::Raw, &path, &file.name, &file.data)?;
            }
            Ok(())
        })
        .await?;

        info!(count, "Upload complete");
        sink.send(Response::Ok).await?;
        Ok(())
    }

    async fn handle_download<W: ResponseSink>(
        &self,
        root: Root,
        path: String,
        sink: &mut W,
    ) -> RouterResult {
        let store = self.store.clone();
        let opened = blocking(move || store.open(root, &path)).await?;
        stream_file(opened.file, opened.name, opened.size, sink).await
    }

    async fn handle_package<W: ResponseSink>(
        &self,
        root: Root,
        path: String,
        sink: &mut W,
    ) -> RouterResult {
        let packager = self.packager.clone();
        let archive = blocking(move || packager.package(root, &path)).await?;

        let file = archive.open().map_err(FileError::Io)?;
        let result = stream_file(file, archive.name().to_string(), archive.size(), sink).await;
        drop(archive);
        result
    }

    async fn handle_delete<W: ResponseSink>(
        &self,
        root: Root,
        path: String,
        sink: &mut W,
    ) -> RouterResult {
        let store = self.store.clone();
        blocking(move || store.delete(root, &path)).await?;
        sink.send(Response::Ok).await?;
        Ok(())
    }

    async fn handle_extract<W: ResponseSink>(&self, path: String, sink: &mut W) -> RouterResult {
        let extraction = self.extraction.clone();
        let dest = blocking(move || extraction.extract(&path)).await?;
        info!(dest = %dest.display(), "Extraction complete");
        sink.send(Response::Ok).await?;
        Ok(())
    }

    async fn handle_disk_usage<W: ResponseSink>(&self, sink: &mut W) -> RouterResult {
        let base = self.resolver.base(Root::Raw).to_path_buf();
        let usage = blocking(move || disk_usage(&base)).await?;
        sink.send(Response::DiskUsage {
            total: format_size(usage.total),
            free: format_size(usage.free),
            used_percent: usage.used_percent(),
        })
        .await?;
        Ok(())
    }

    // =========================================================================
    // Transfer Handlers
    // =========================================================================

    async fn handle_start_transfer<W: ResponseSink>(
        &self,
        input: String,
        mode: TransferMode,
        sink: &mut W,
    ) -> RouterResult {
        let transfer = self.transfers.start(&input)?;

        match mode {
            TransferMode::Detach => {
                sink.send(Response::TransferStarted {
                    id: transfer.id().clone(),
                })
                .await?;
            }
            TransferMode::Follow => {
                sink.send(Response::TransferStarted {
                    id: transfer.id().clone(),
                })
                .await?;
                let mut subscription = transfer.subscribe();
                while let Some(line) = subscription.next_line().await {
                    if let Err(e) = sink.send(Response::TransferLine { line }).await {
                        warn!(id = %transfer.id(), error = %e, "Follower disconnected; transfer continues");
                        return Err(e.into());
                    }
                }
                let outcome = transfer.wait().await;
                sink.send(Response::TransferResult {
                    id: outcome.id,
                    state: outcome.state,
                    exit_code: outcome.exit_code,
                    log: outcome.log,
                })
                .await?;
            }
            TransferMode::Wait => {
                let outcome = transfer.wait().await;
                sink.send(Response::TransferResult {
                    id: outcome.id,
                    state: outcome.state,
                    exit_code: outcome.exit_code,
                    log: outcome.log,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_poll<W: ResponseSink>(
        &self,
        id: String,
        from: usize,
        sink: &mut W,
    ) -> RouterResult {
        let (lines, next, state) = self.transfers.poll(&id, from)?;
        sink.send(Response::TransferProgress {
            id,
            state,
            lines,
            next,
        })
        .await?;
        Ok(())
    }
}

/// Stream an open file as `FileStart`, one or more `FileChunk`, `FileEnd`.
async fn stream_file<W: ResponseSink>(
    file: std::fs::File,
    name: String,
    size: u64,
    sink: &mut W,
) -> RouterResult {
    sink.send(Response::FileStart { name, size }).await?;

    // The file may still be growing under a running transfer.
    let mut file = tokio::fs::File::from_std(file).take(size);
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    let mut chunks = 0usize;
    loop {
        let n = file.read(&mut buf).await.map_err(FileError::Io)?;
        if n == 0 {
            break;
        }
        sink.send(Response::FileChunk {
            data: buf[..n].to_vec(),
        })
        .await?;
        chunks += 1;
    }
    if chunks == 0 {
        sink.send(Response::FileChunk { data: Vec::new() }).await?;
    }

    sink.send(Response::FileEnd).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::prepare_storage;
    use protocol::{EntryKind, TransferState};
    use serial_test::serial;
    use std::fs;
    use std::io::{Cursor, Read};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Appends to a file as soon as the download has started.
    struct GrowingSink {
        path: std::path::PathBuf,
        responses: Vec<Response>,
    }

    impl ResponseSink for GrowingSink {
        async fn send(&mut self, response: Response) -> Result<(), IpcError> {
            if matches!(response, Response::FileStart { .. }) {
                let mut file = fs::OpenOptions::new().append(true).open(&self.path).unwrap();
                std::io::Write::write_all(&mut file, &[b'+'; 1000]).unwrap();
            }
            self.responses.push(response);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_file_stops_at_announced_size() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("partial.bin");
        fs::write(&path, vec![7u8; DOWNLOAD_CHUNK_SIZE + 10]).unwrap();
        let file = fs::File::open(&path).unwrap();
        let size = file.metadata().unwrap().len();

        let mut sink = GrowingSink {
            path: path.clone(),
            responses: Vec::new(),
        };
        stream_file(file, "partial.bin".to_string(), size, &mut sink)
            .await
            .unwrap();

        let streamed: usize = sink
            .responses
            .iter()
            .map(|r| match r {
                Response::FileChunk { data } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(streamed as u64, size);
        assert_eq!(fs::metadata(&path).unwrap().len(), size + 1000);
        assert!(matches!(sink.responses.last(), Some(Response::FileEnd)));
    }

    fn test_config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp.path().join("data");
        config
    }

    fn create_test_router(temp: &TempDir) -> MessageRouter {
        let config = test_config(temp);
        let resolver = prepare_storage(&config).unwrap();
        MessageRouter::new(&config, resolver)
    }

    async fn call(router: &MessageRouter, request: Request) -> Vec<Response> {
        let mut responses = Vec::new();
        router.dispatch(request, &mut responses).await.unwrap();
        responses
    }

    fn upload(path: &str, name: &str, data: &[u8]) -> Request {
        Request::Upload {
            path: path.to_string(),
            files: vec![UploadFile {
                name: name.to_string(),
                data: data.to_vec(),
            }],
        }
    }

    fn error_code(responses: &[Response]) -> ErrorCode {
        match responses {
            [Response::Error { code, .. }] => *code,
            other => panic!("expected a single error, got {:?}", other),
        }
    }

    /// Reassemble a FileStart/FileChunk/FileEnd stream.
    fn collect_stream(responses: Vec<Response>) -> (String, Vec<u8>) {
        let mut iter = responses.into_iter();
        let (name, size) = match iter.next() {
            Some(Response::FileStart { name, size }) => (name, size),
            other => panic!("expected FileStart, got {:?}", other),
        };
        let mut data = Vec::new();
        for response in iter {
            match response {
                Response::FileChunk { data: chunk } => data.extend(chunk),
                Response::FileEnd => {
                    assert_eq!(data.len() as u64, size);
                    return (name, data);
                }
                other => panic!("unexpected response {:?}", other),
            }
        }
        panic!("stream ended without FileEnd");
    }

    #[test]
    fn test_error_codes() {
        let cases = [
            (
                RouterError::File(FileError::Traversal("raw:/..".into())),
                ErrorCode::Traversal,
            ),
            (
                RouterError::File(FileError::InvalidName("..".into())),
                ErrorCode::Traversal,
            ),
            (
                RouterError::File(FileError::NotFound("raw:/x".into())),
                ErrorCode::NotFound,
            ),
            (
                RouterError::File(FileError::Packaging("zip".into())),
                ErrorCode::PackagingFailed,
            ),
            (
                RouterError::File(FileError::Extraction("crc".into())),
                ErrorCode::ExtractionFailed,
            ),
            (
                RouterError::Transfer(TransferError::AlreadyRunning("id".into())),
                ErrorCode::AlreadyRunning,
            ),
            (
                RouterError::Transfer(TransferError::InvalidInput("empty".into())),
                ErrorCode::InvalidRequest,
            ),
            (
                RouterError::Internal("boom".into()),
                ErrorCode::Internal,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "{}", err);
        }
    }

    #[tokio::test]
    async fn test_route_ping_and_status() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        assert_eq!(call(&router, Request::Ping).await, vec![Response::Pong]);
        match &call(&router, Request::Status).await[..] {
            [Response::Status {
                version, transfer, ..
            }] => {
                assert_eq!(*version, PROTOCOL_VERSION);
                assert!(transfer.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_then_list_then_delete() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let data = vec![7u8; 50_000];
        assert_eq!(
            call(&router, upload("", "report.zip", &data)).await,
            vec![Response::Ok]
        );

        let responses = call(
            &router,
            Request::List {
                root: Root::Raw,
                path: String::new(),
            },
        )
        .await;
        let entries = match &responses[..] {
            [Response::Listing { entries, .. }] => entries.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "report.zip");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, Some(50_000));
        assert!(entries[0].is_archive);

        assert_eq!(
            call(
                &router,
                Request::Delete {
                    root: Root::Raw,
                    path: "report.zip".to_string()
                }
            )
            .await,
            vec![Response::Ok]
        );
        let responses = call(
            &router,
            Request::List {
                root: Root::Raw,
                path: String::new(),
            },
        )
        .await;
        assert!(matches!(&responses[..], [Response::Listing { entries, .. }] if entries.is_empty()));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_names_before_writing() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let request = Request::Upload {
            path: String::new(),
            files: vec![
                UploadFile {
                    name: "good.txt".to_string(),
                    data: b"x".to_vec(),
                },
                UploadFile {
                    name: "../bad.txt".to_string(),
                    data: b"y".to_vec(),
                },
            ],
        };
        assert_eq!(error_code(&call(&router, request).await), ErrorCode::Traversal);
        assert!(!temp.path().join("data/downloads/good.txt").exists());

        let empty = Request::Upload {
            path: String::new(),
            files: Vec::new(),
        };
        assert_eq!(
            error_code(&call(&router, empty).await),
            ErrorCode::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_download_streams_in_chunks() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);
        let data: Vec<u8> = (0..(DOWNLOAD_CHUNK_SIZE * 2 + 10))
            .map(|i| (i % 251) as u8)
            .collect();
        call(&router, upload("", "big.bin", &data)).await;

        let responses = call(
            &router,
            Request::Download {
                root: Root::Raw,
                path: "big.bin".to_string(),
            },
        )
        .await;
        assert_eq!(responses.len(), 5);
        let (name, received) = collect_stream(responses);
        assert_eq!(name, "big.bin");
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_download_empty_file() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);
        call(&router, upload("", "empty", b"")).await;

        let responses = call(
            &router,
            Request::Download {
                root: Root::Raw,
                path: "empty".to_string(),
            },
        )
        .await;
        assert_eq!(responses.len(), 3);
        let (_, received) = collect_stream(responses);
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_download_errors() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let missing = Request::Download {
            root: Root::Raw,
            path: "nope".to_string(),
        };
        assert_eq!(error_code(&call(&router, missing).await), ErrorCode::NotFound);

        let traversal = Request::Download {
            root: Root::Extracted,
            path: "../../etc/passwd".to_string(),
        };
        assert_eq!(
            error_code(&call(&router, traversal).await),
            ErrorCode::Traversal
        );

        let directory = Request::Download {
            root: Root::Raw,
            path: String::new(),
        };
        assert_eq!(
            error_code(&call(&router, directory).await),
            ErrorCode::InvalidRequest
        );
    }

    #[tokio::test]
    async fn test_package_directory() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);
        let dir = temp.path().join("data/extracted/photos");
        fs::create_dir_all(&dir).unwrap();
        for (name, content) in [("a.jpg", "aaa"), ("b.jpg", "bbb"), ("c.jpg", "ccc")] {
            fs::write(dir.join(name), content).unwrap();
        }

        let responses = call(
            &router,
            Request::Package {
                root: Root::Extracted,
                path: "photos".to_string(),
            },
        )
        .await;
        let (name, bytes) = collect_stream(responses);
        assert_eq!(name, "photos.zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);
        for (name, content) in [("a.jpg", "aaa"), ("b.jpg", "bbb"), ("c.jpg", "ccc")] {
            let mut text = String::new();
            archive
                .by_name(name)
                .unwrap()
                .read_to_string(&mut text)
                .unwrap();
            assert_eq!(text, content);
        }

        let scratch = temp.path().join("data/scratch");
        assert_eq!(fs::read_dir(scratch).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_delete_root_rejected() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let request = Request::Delete {
            root: Root::Raw,
            path: String::new(),
        };
        assert_eq!(
            error_code(&call(&router, request).await),
            ErrorCode::InvalidRequest
        );
        assert!(temp.path().join("data/downloads").is_dir());
    }

    #[tokio::test]
    async fn test_extract_errors() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let missing = Request::Extract {
            path: "ghost.zip".to_string(),
        };
        assert_eq!(error_code(&call(&router, missing).await), ErrorCode::NotFound);

        call(&router, upload("", "broken.zip", b"garbage")).await;
        let broken = Request::Extract {
            path: "broken.zip".to_string(),
        };
        assert_eq!(
            error_code(&call(&router, broken).await),
            ErrorCode::ExtractionFailed
        );
    }

    #[tokio::test]
    async fn test_disk_usage() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        match &call(&router, Request::DiskUsage).await[..] {
            [Response::DiskUsage {
                total,
                free,
                used_percent,
            }] => {
                assert!(total.ends_with('B'));
                assert!(free.ends_with('B'));
                assert!((0.0..=100.0).contains(used_percent));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn transfer_router(temp: &TempDir, body: &str) -> MessageRouter {
        let program = temp.path().join("fake-aria2c");
        fs::write(&program, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = test_config(temp);
        config.transfer.program = program.to_string_lossy().into_owned();
        let resolver = prepare_storage(&config).unwrap();
        MessageRouter::new(&config, resolver)
    }

    #[tokio::test]
    #[serial]
    async fn test_transfer_follow() {
        let temp = TempDir::new().unwrap();
        let router = transfer_router(&temp, "echo 'Download started'; echo 'Download complete'");

        let responses = call(
            &router,
            Request::StartTransfer {
                input: "magnet:?xt=urn:btih:abc".to_string(),
                mode: TransferMode::Follow,
            },
        )
        .await;

        assert!(matches!(responses[0], Response::TransferStarted { .. }));
        assert_eq!(
            responses[1],
            Response::TransferLine {
                line: "Download started".to_string()
            }
        );
        assert_eq!(
            responses[2],
            Response::TransferLine {
                line: "Download complete".to_string()
            }
        );
        match &responses[3] {
            Response::TransferResult {
                state,
                exit_code,
                log,
                ..
            } => {
                assert_eq!(*state, TransferState::Succeeded);
                assert_eq!(*exit_code, Some(0));
                assert_eq!(log.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(responses.len(), 4);
    }

    #[tokio::test]
    #[serial]
    async fn test_transfer_wait_failure() {
        let temp = TempDir::new().unwrap();
        let router = transfer_router(&temp, "echo 'errorCode=1' >&2; exit 1");

        let responses = call(
            &router,
            Request::StartTransfer {
                input: "https://example.com/x".to_string(),
                mode: TransferMode::Wait,
            },
        )
        .await;
        match &responses[..] {
            [Response::TransferResult {
                state,
                exit_code,
                log,
                ..
            }] => {
                assert_eq!(*state, TransferState::Failed);
                assert_eq!(*exit_code, Some(1));
                assert_eq!(log, &vec!["errorCode=1".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_transfer_detach_poll_and_already_running() {
        let temp = TempDir::new().unwrap();
        let router = transfer_router(&temp, "echo one; sleep 1; echo two");

        let responses = call(
            &router,
            Request::StartTransfer {
                input: "magnet:?xt=1".to_string(),
                mode: TransferMode::Detach,
            },
        )
        .await;
        let id = match &responses[..] {
            [Response::TransferStarted { id }] => id.clone(),
            other => panic!("unexpected {:?}", other),
        };

        let busy = Request::StartTransfer {
            input: "magnet:?xt=2".to_string(),
            mode: TransferMode::Detach,
        };
        assert_eq!(
            error_code(&call(&router, busy).await),
            ErrorCode::AlreadyRunning
        );

        router.transfers().get(&id).unwrap().wait().await;

        let responses = call(
            &router,
            Request::PollTransfer {
                id: id.clone(),
                from: 1,
            },
        )
        .await;
        assert_eq!(
            responses,
            vec![Response::TransferProgress {
                id: id.clone(),
                state: TransferState::Succeeded,
                lines: vec!["two".to_string()],
                next: 2,
            }]
        );

        match &call(&router, Request::Status).await[..] {
            [Response::Status {
                transfer: Some(summary),
                ..
            }] => {
                assert_eq!(summary.id, id);
                assert_eq!(summary.lines, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transfer_empty_input() {
        let temp = TempDir::new().unwrap();
        let router = create_test_router(&temp);

        let request = Request::StartTransfer {
            input: String::new(),
            mode: TransferMode::Wait,
        };
        assert_eq!(
            error_code(&call(&router, request).await),
            ErrorCode::InvalidRequest
        );

        let poll = Request::PollTransfer {
            id: "missing".to_string(),
            from: 0,
        };
        assert_eq!(error_code(&call(&router, poll).await), ErrorCode::NotFound);
    }
}
