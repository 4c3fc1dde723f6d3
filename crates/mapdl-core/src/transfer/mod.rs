//! File transfer and streamed command output.
//!
//! Uploads read the local file chunk by chunk and stream the chunks to the
//! solver; the solver's acknowledgement must match the local file size.
//! Downloads write each chunk to disk as it arrives. Console sessions cannot
//! transfer files.

mod chunk;

pub use chunk::ChunkSize;

use crate::config::TransferConfig;
use crate::connection::{validate_command, ConnectionManager};
use crate::error::{MapdlError, Result};
use crate::options::LaunchMode;
use crate::rpc::{Call, Reply, SolverTransport, StreamItem, StreamSink};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Moves files and streamed output across a solver connection.
#[derive(Clone)]
pub struct TransferEngine {
    transport: Arc<dyn SolverTransport>,
    chunk_size: ChunkSize,
    flush_interval: Duration,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("peer", &self.transport.peer())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl TransferEngine {
    pub fn new(transport: Arc<dyn SolverTransport>) -> Self {
        Self {
            transport,
            chunk_size: ChunkSize::default(),
            flush_interval: TransferConfig::STREAM_FLUSH_INTERVAL,
        }
    }

    pub fn for_connection(connection: &ConnectionManager) -> Self {
        Self::new(connection.transport())
    }

    pub fn with_chunk_size(mut self, chunk_size: ChunkSize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn chunk_size(&self) -> ChunkSize {
        self.chunk_size
    }

    fn ensure_transfers(&self) -> Result<()> {
        match self.transport.mode() {
            LaunchMode::Grpc => Ok(()),
            mode => Err(MapdlError::TransferUnsupported { mode: mode.to_string() }),
        }
    }

    /// Upload `local_path` and return the remote file name.
    ///
    /// The remote name defaults to the local file name.
    pub async fn upload(&self, local_path: &Path, remote_name: Option<&str>) -> Result<String> {
        self.ensure_transfers()?;
        let name = match remote_name {
            Some(name) => name.to_string(),
            None => local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| MapdlError::config(format!("{} has no file name", local_path.display())))?,
        };

        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| MapdlError::io_with_path(e, local_path))?;
        let expected = file
            .metadata()
            .await
            .map_err(|e| MapdlError::io_with_path(e, local_path))?
            .len();
        debug!("Uploading {} ({} bytes) as '{}'", local_path.display(), expected, name);

        let chunk = self.chunk_size.get();
        let chunks = stream::try_unfold(file, move |mut file| async move {
            let mut buf = Vec::with_capacity(chunk);
            (&mut file).take(chunk as u64).read_to_end(&mut buf).await?;
            if buf.is_empty() {
                Ok::<_, MapdlError>(None)
            } else {
                Ok(Some((Bytes::from(buf), file)))
            }
        })
        .boxed();

        let reply = self
            .transport
            .client_stream(Call::UploadFile { name: name.clone() }, chunks)
            .await?;
        let actual = match reply {
            Reply::Ack { bytes } => bytes,
            other => {
                return Err(MapdlError::Protocol {
                    message: format!("unexpected upload reply {:?}", other),
                })
            }
        };
        if actual != expected {
            return Err(MapdlError::TransferSizeMismatch { name, expected, actual });
        }

        info!("Uploaded '{}' ({} bytes)", name, actual);
        Ok(name)
    }

    /// Download `remote_name` into `local_path` and return the byte count.
    ///
    /// Zero bytes means the remote file is missing or empty; the local file
    /// is then removed and [`MapdlError::RemoteFileNotFound`] returned.
    pub async fn download(&self, remote_name: &str, local_path: &Path) -> Result<u64> {
        self.ensure_transfers()?;
        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| MapdlError::io_with_path(e, local_path))?;
        debug!("Downloading '{}' to {}", remote_name, local_path.display());

        let total = match self.download_into(remote_name, &mut file, local_path).await {
            Ok(total) => total,
            Err(e) => {
                let _ = tokio::fs::remove_file(local_path).await;
                return Err(e);
            }
        };

        if total == 0 {
            let _ = tokio::fs::remove_file(local_path).await;
            return Err(MapdlError::RemoteFileNotFound {
                name: remote_name.to_string(),
            });
        }
        info!("Downloaded '{}' ({} bytes)", remote_name, total);
        Ok(total)
    }

    /// Stream `remote_name` into `writer`. At most
    /// [`TransferConfig::DOWNLOAD_QUEUE_DEPTH`] chunks wait between the
    /// connection and the writer; a slow writer stalls the connection.
    async fn download_into<W>(&self, remote_name: &str, writer: &mut W, target: &Path) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(TransferConfig::DOWNLOAD_QUEUE_DEPTH);
        let call = Call::DownloadFile {
            name: remote_name.to_string(),
            chunk_size: self.chunk_size.get(),
        };

        let receive = async move {
            let mut sink = ChunkSink { tx };
            self.transport.server_stream(call, &mut sink).await
        };
        // Owns the receiver so a failed write closes the channel
        let write = async move {
            let mut total = 0u64;
            while let Some(chunk) = rx.recv().await {
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| MapdlError::io_with_path(e, target))?;
                total += chunk.len() as u64;
            }
            writer.flush().await.map_err(|e| MapdlError::io_with_path(e, target))?;
            Ok::<u64, MapdlError>(total)
        };

        let (received, written) = tokio::join!(receive, write);
        let total = written?;
        received?;
        Ok(total)
    }

    /// Run a command with streamed output and return the whole output.
    ///
    /// With `verbose`, each piece is echoed to stdout as it arrives.
    pub async fn stream_command(&self, command: &str, verbose: bool) -> Result<String> {
        let command = validate_command(command)?.to_string();
        self.stream_text(
            Call::RunStreamed {
                command,
                flush_interval_ms: self.flush_interval_ms(),
            },
            verbose,
        )
        .await
    }

    /// Run an input file that is already on the solver, with streamed output.
    pub async fn input_file(&self, remote_name: &str, verbose: bool) -> Result<String> {
        self.stream_text(
            Call::InputStreamed {
                file: remote_name.to_string(),
                flush_interval_ms: self.flush_interval_ms(),
            },
            verbose,
        )
        .await
    }

    fn flush_interval_ms(&self) -> u64 {
        self.flush_interval.as_millis() as u64
    }

    async fn stream_text(&self, call: Call, verbose: bool) -> Result<String> {
        let mut output = String::new();
        let mut sink = |item: StreamItem| -> Result<()> {
            let piece = match item {
                StreamItem::Reply(Reply::Text { text }) => text,
                other => {
                    return Err(MapdlError::Protocol {
                        message: format!("unexpected item in output stream: {:?}", other),
                    })
                }
            };
            if verbose {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(piece.as_bytes());
                let _ = stdout.flush();
            }
            output.push_str(&piece);
            Ok(())
        };
        self.transport.server_stream(call, &mut sink).await?;
        Ok(output)
    }
}

/// Forwards download chunks to the writer through a bounded channel.
struct ChunkSink {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl StreamSink for ChunkSink {
    async fn accept(&mut self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Chunk(bytes) => self
                .tx
                .send(bytes)
                .await
                .map_err(|_| MapdlError::Internal("download writer stopped".into())),
            StreamItem::Reply(reply) => Err(MapdlError::Protocol {
                message: format!("unexpected item in download stream: {:?}", reply),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{ConsoleTransport, FramedTransport, SolverServer, SolverService, Status, StatusResult};
    use futures::stream::BoxStream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FileStore {
        files: Mutex<HashMap<String, Vec<u8>>>,
        short_ack: bool,
    }

    #[async_trait]
    impl SolverService for FileStore {
        async fn upload(&self, name: &str, data: Vec<u8>) -> StatusResult<u64> {
            let len = data.len() as u64;
            self.files.lock().unwrap().insert(name.to_string(), data);
            Ok(if self.short_ack { len.saturating_sub(1) } else { len })
        }

        async fn download(&self, name: &str) -> StatusResult<Vec<u8>> {
            Ok(self.files.lock().unwrap().get(name).cloned().unwrap_or_default())
        }

        async fn run_streamed(&self, command: &str, out: mpsc::Sender<String>) -> StatusResult<()> {
            for piece in ["SOLVING ", "LOAD STEP 1 ", &format!("DONE {}", command)] {
                out.send(piece.to_string())
                    .await
                    .map_err(|_| Status::new(crate::rpc::StatusCode::Cancelled, "client gone"))?;
            }
            Ok(())
        }
    }

    async fn engine(store: Arc<FileStore>) -> (TransferEngine, crate::rpc::SolverServerHandle) {
        let server = SolverServer::start(store).await.unwrap();
        let transport = FramedTransport::connect(
            &server.addr().to_string(),
            Duration::from_secs(2),
            TransferConfig::MAX_CHUNK_SIZE * 2,
        )
        .await
        .unwrap();
        (TransferEngine::new(Arc::new(transport)), server)
    }

    #[tokio::test]
    async fn test_round_trip_across_chunks() {
        let (engine, _server) = engine(Arc::new(FileStore::default())).await;
        let engine = engine.with_chunk_size(ChunkSize::new(1000).unwrap());
        let dir = TempDir::new().unwrap();

        for len in [1usize, 999, 1000, 1001, 5000] {
            let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let local = dir.path().join(format!("in_{}.bin", len));
            std::fs::write(&local, &content).unwrap();

            let name = engine.upload(&local, None).await.unwrap();
            assert_eq!(name, format!("in_{}.bin", len));

            let back = dir.path().join(format!("out_{}.bin", len));
            let count = engine.download(&name, &back).await.unwrap();
            assert_eq!(count, len as u64);
            assert_eq!(std::fs::read(&back).unwrap(), content);
        }
    }

    /// Sends a fixed number of 1 KiB chunks, counting each one the sink took.
    struct ChunkFeed {
        chunks: usize,
        accepted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SolverTransport for ChunkFeed {
        fn peer(&self) -> String {
            "feed".into()
        }

        async fn unary(&self, call: Call) -> Result<Reply> {
            Err(MapdlError::Protocol {
                message: format!("unexpected call {}", call.method()),
            })
        }

        async fn server_stream(&self, _call: Call, sink: &mut dyn StreamSink) -> Result<()> {
            for _ in 0..self.chunks {
                sink.accept(StreamItem::Chunk(Bytes::from(vec![7u8; 1024]))).await?;
                self.accepted.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn client_stream(&self, call: Call, _chunks: BoxStream<'_, Result<Bytes>>) -> Result<Reply> {
            Err(MapdlError::Protocol {
                message: format!("unexpected call {}", call.method()),
            })
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_slow_writer_holds_back_download() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let engine = TransferEngine::new(Arc::new(ChunkFeed {
            chunks: 64,
            accepted: accepted.clone(),
        }));
        // Room for one chunk until the reader catches up
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let drain = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let queued = accepted.load(Ordering::SeqCst);
            let mut received = vec![0u8; 64 * 1024];
            reader.read_exact(&mut received).await.unwrap();
            queued
        };
        let (total, queued) = tokio::join!(
            engine.download_into("big.rst", &mut writer, Path::new("big.rst")),
            drain
        );

        assert!(
            queued <= TransferConfig::DOWNLOAD_QUEUE_DEPTH + 2,
            "{} chunks taken before the writer drained",
            queued
        );
        assert_eq!(total.unwrap(), 64 * 1024);
        assert_eq!(accepted.load(Ordering::SeqCst), 64);
    }

    #[tokio::test]
    async fn test_empty_download_is_not_found() {
        let (engine, _server) = engine(Arc::new(FileStore::default())).await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("empty.txt");
        std::fs::write(&local, b"").unwrap();

        engine.upload(&local, Some("empty.txt")).await.unwrap();
        let target = dir.path().join("missing.txt");
        let err = engine.download("empty.txt", &target).await.unwrap_err();
        assert!(matches!(err, MapdlError::RemoteFileNotFound { .. }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_upload_size_mismatch() {
        let store = Arc::new(FileStore {
            short_ack: true,
            ..Default::default()
        });
        let (engine, _server) = engine(store).await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("model.db");
        std::fs::write(&local, vec![7u8; 2048]).unwrap();

        let err = engine.upload(&local, None).await.unwrap_err();
        match err {
            MapdlError::TransferSizeMismatch { expected, actual, .. } => {
                assert_eq!(expected, 2048);
                assert_eq!(actual, 2047);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upload_missing_local_file() {
        let (engine, _server) = engine(Arc::new(FileStore::default())).await;
        let err = engine
            .upload(Path::new("/nonexistent/input.inp"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stream_command_concatenates() {
        let (engine, _server) = engine(Arc::new(FileStore::default())).await;
        let output = engine.stream_command("SOLVE", false).await.unwrap();
        assert_eq!(output, "SOLVING LOAD STEP 1 DONE SOLVE");
    }

    #[tokio::test]
    async fn test_console_rejects_transfers() {
        let (reader, _w) = tokio::io::duplex(64);
        let (_r, writer) = tokio::io::duplex(64);
        let engine = TransferEngine::new(Arc::new(ConsoleTransport::new(reader, writer, "console")));
        let dir = TempDir::new().unwrap();

        let err = engine
            .download("file.rst", &dir.path().join("file.rst"))
            .await
            .unwrap_err();
        assert!(matches!(err, MapdlError::TransferUnsupported { .. }));
    }
}
