//! TCP endpoint speaking the solver protocol.
//!
//! Listens on a local address, accepts connections, and dispatches each call
//! to a [`SolverService`]. Used to stand in for the solver in tests and by
//! tools that proxy a session.
//!
//! # Thread Safety
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task and processes one call at a time. The service is shared via
//! `Arc` and must synchronize its own state.

use super::protocol::{
    parse_json, read_frame, write_frame, write_json, Call, ClientFrame, Reply, ServerFrame, Status,
};
use crate::cancel::CancellationToken;
use crate::config::{NetworkConfig, TransferConfig};
use crate::error::{MapdlError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Result type of service methods.
pub type StatusResult<T> = std::result::Result<T, Status>;

/// Behaviour of a solver endpoint.
///
/// Every method defaults to `UNIMPLEMENTED`, so a service only provides what
/// it supports.
#[async_trait]
pub trait SolverService: Send + Sync + 'static {
    async fn channel_ready(&self) -> StatusResult<()> {
        Ok(())
    }

    /// Control instruction. After a successful `EXIT` the server shuts down.
    async fn ctrl(&self, request: &str, _opt: Option<&str>) -> StatusResult<String> {
        if request.eq_ignore_ascii_case("exit") {
            return Ok(String::new());
        }
        Err(Status::unimplemented("ctrl"))
    }

    async fn run_command(&self, _command: &str) -> StatusResult<String> {
        Err(Status::unimplemented("run_command"))
    }

    async fn run_streamed(&self, _command: &str, _out: mpsc::Sender<String>) -> StatusResult<()> {
        Err(Status::unimplemented("run_streamed"))
    }

    async fn input_streamed(&self, _file: &str, _out: mpsc::Sender<String>) -> StatusResult<()> {
        Err(Status::unimplemented("input_streamed"))
    }

    async fn inquire(&self, _function: &str) -> StatusResult<String> {
        Err(Status::unimplemented("inquire"))
    }

    async fn set_parameter(&self, _name: &str, _value: &str) -> StatusResult<()> {
        Err(Status::unimplemented("set_parameter"))
    }

    async fn get_scalar(&self, _query: &str) -> StatusResult<String> {
        Err(Status::unimplemented("get_scalar"))
    }

    async fn get_array(&self, _name: &str) -> StatusResult<Vec<f64>> {
        Err(Status::unimplemented("get_array"))
    }

    /// Store an uploaded file; returns the number of bytes stored.
    async fn upload(&self, _name: &str, _data: Vec<u8>) -> StatusResult<u64> {
        Err(Status::unimplemented("upload_file"))
    }

    async fn download(&self, _name: &str) -> StatusResult<Vec<u8>> {
        Err(Status::unimplemented("download_file"))
    }

    /// Push serving-status updates until the watch should end.
    async fn health_watch(&self, _out: mpsc::Sender<bool>) -> StatusResult<()> {
        Err(Status::unimplemented("health_watch"))
    }
}

/// Handle to a running server. Dropping shuts down the server.
pub struct SolverServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SolverServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and closes all active connections.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
    }

    /// True once the server stopped, by [`Self::shutdown`] or an `EXIT` call.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for SolverServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Solver protocol server.
pub struct SolverServer;

impl SolverServer {
    /// Start on a random local port.
    pub async fn start<S: SolverService>(service: Arc<S>) -> Result<SolverServerHandle> {
        Self::bind("127.0.0.1:0", service).await
    }

    /// Start on `addr`.
    pub async fn bind<S: SolverService>(addr: &str, service: Arc<S>) -> Result<SolverServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Solver server listening on {}", addr);

        let shutdown = CancellationToken::new();
        let task_handle = tokio::spawn(Self::accept_loop(listener, service, shutdown.clone()));

        Ok(SolverServerHandle {
            addr,
            shutdown,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<S: SolverService>(listener: TcpListener, service: Arc<S>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Solver server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let service = service.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                debug!("Solver connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, &*service, &shutdown).await {
                                    debug!("Solver connection {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Solver server accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<S: SolverService>(
        mut stream: TcpStream,
        service: &S,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader, NetworkConfig::MAX_MESSAGE_LENGTH) => {
                    match result? {
                        Some(f) => f,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown.cancelled() => {
                    return Ok(()); // Server shutting down
                }
            };

            let ClientFrame::Call { id, call } = match parse_json::<ClientFrame>(&frame) {
                Ok(frame) => frame,
                Err(e) => {
                    let status = Status::invalid_argument(format!("Parse error: {}", e));
                    write_json(&mut writer, &ServerFrame::Error { id: 0, status }).await?;
                    continue;
                }
            };
            debug!("Solver call {} ({})", id, call.method());

            let flow = tokio::select! {
                flow = Self::process_call(id, call, service, &mut reader, &mut writer) => flow?,
                _ = shutdown.cancelled() => return Ok(()),
            };
            if let Flow::Close = flow {
                shutdown.cancel();
                return Ok(());
            }
        }
    }

    async fn process_call<S, R, W>(id: u64, call: Call, service: &S, reader: &mut R, writer: &mut W) -> Result<Flow>
    where
        S: SolverService,
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let reply = match call {
            Call::ChannelReady => service.channel_ready().await.map(|_| Reply::Ready),
            Call::Ctrl { request, opt } => {
                let outcome = service.ctrl(&request, opt.as_deref()).await;
                if outcome.is_ok() && request.eq_ignore_ascii_case("exit") {
                    info!("EXIT requested; closing solver server");
                    return Ok(Flow::Close);
                }
                outcome.map(|text| Reply::Text { text })
            }
            Call::RunCommand { command } => service.run_command(&command).await.map(|text| Reply::Text { text }),
            Call::Inquire { function } => service.inquire(&function).await.map(|text| Reply::Text { text }),
            Call::SetParameter { name, value } => service.set_parameter(&name, &value).await.map(|_| Reply::Empty),
            Call::GetScalar { query } => service.get_scalar(&query).await.map(|value| Reply::Scalar { value }),
            Call::RunStreamed { command, .. } => {
                let (tx, rx) = mpsc::channel(NetworkConfig::STREAM_BUFFER);
                let (outcome, forwarded) =
                    tokio::join!(service.run_streamed(&command, tx), forward_text(writer, id, rx));
                forwarded?;
                return end_stream(writer, id, outcome).await;
            }
            Call::InputStreamed { file, .. } => {
                let (tx, rx) = mpsc::channel(NetworkConfig::STREAM_BUFFER);
                let (outcome, forwarded) =
                    tokio::join!(service.input_streamed(&file, tx), forward_text(writer, id, rx));
                forwarded?;
                return end_stream(writer, id, outcome).await;
            }
            Call::HealthWatch => {
                let (tx, mut rx) = mpsc::channel(NetworkConfig::STREAM_BUFFER);
                let out = &mut *writer;
                // Owns `rx` so a failed write closes the channel for the service
                let forward = async move {
                    while let Some(serving) = rx.recv().await {
                        write_json(out, &ServerFrame::Item { id, reply: Reply::Health { serving } }).await?;
                    }
                    Ok::<(), MapdlError>(())
                };
                let (outcome, forwarded) = tokio::join!(service.health_watch(tx), forward);
                forwarded?;
                return end_stream(writer, id, outcome).await;
            }
            Call::GetArray { name, chunk_size } => {
                let outcome = service.get_array(&name).await.map(|values| {
                    values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>()
                });
                // Keep chunks aligned on whole values
                let chunk_size = (chunk_size.max(8) / 8) * 8;
                return send_chunks(writer, id, outcome, chunk_size).await;
            }
            Call::DownloadFile { name, chunk_size } => {
                let outcome = service.download(&name).await;
                return send_chunks(writer, id, outcome, chunk_size).await;
            }
            Call::UploadFile { name } => {
                let mut data = Vec::new();
                loop {
                    let chunk = read_frame(reader, NetworkConfig::MAX_MESSAGE_LENGTH)
                        .await?
                        .ok_or_else(|| MapdlError::Protocol {
                            message: "connection closed during upload".to_string(),
                        })?;
                    if chunk.is_empty() {
                        break;
                    }
                    data.extend_from_slice(&chunk);
                }
                service.upload(&name, data).await.map(|bytes| Reply::Ack { bytes })
            }
        };

        let frame = match reply {
            Ok(reply) => ServerFrame::Reply { id, reply },
            Err(status) => ServerFrame::Error { id, status },
        };
        write_json(writer, &frame).await?;
        Ok(Flow::Continue)
    }
}

async fn forward_text<W: AsyncWrite + Unpin>(writer: &mut W, id: u64, mut rx: mpsc::Receiver<String>) -> Result<()> {
    while let Some(text) = rx.recv().await {
        write_json(writer, &ServerFrame::Item { id, reply: Reply::Text { text } }).await?;
    }
    Ok(())
}

async fn end_stream<W: AsyncWrite + Unpin>(writer: &mut W, id: u64, outcome: StatusResult<()>) -> Result<Flow> {
    let frame = match outcome {
        Ok(()) => ServerFrame::End { id },
        Err(status) => ServerFrame::Error { id, status },
    };
    write_json(writer, &frame).await?;
    Ok(Flow::Continue)
}

async fn send_chunks<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: u64,
    outcome: StatusResult<Vec<u8>>,
    chunk_size: usize,
) -> Result<Flow> {
    let data = match outcome {
        Ok(data) => data,
        Err(status) => {
            write_json(writer, &ServerFrame::Error { id, status }).await?;
            return Ok(Flow::Continue);
        }
    };
    let chunk_size = if chunk_size == 0 {
        TransferConfig::DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    for chunk in data.chunks(chunk_size) {
        write_json(writer, &ServerFrame::Chunk { id, len: chunk.len() }).await?;
        write_frame(writer, chunk).await?;
    }
    write_json(writer, &ServerFrame::End { id }).await?;
    Ok(Flow::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::StatusCode;

    struct EchoService;

    #[async_trait]
    impl SolverService for EchoService {
        async fn run_command(&self, command: &str) -> StatusResult<String> {
            Ok(command.to_string())
        }

        async fn download(&self, name: &str) -> StatusResult<Vec<u8>> {
            if name == "missing" {
                return Err(Status::not_found("no such file"));
            }
            Ok(vec![7u8; 10])
        }
    }

    async fn call(stream: &mut TcpStream, id: u64, call: Call) -> ServerFrame {
        let (mut reader, mut writer) = stream.split();
        write_json(&mut writer, &ClientFrame::Call { id, call }).await.unwrap();
        let payload = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        parse_json(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();

        assert!(handle.port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
        assert!(handle.is_shut_down());
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let mut handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let frame = call(&mut stream, 1, Call::RunCommand { command: "/SOLU".into() }).await;
        match frame {
            ServerFrame::Reply { id, reply } => {
                assert_eq!(id, 1);
                assert_eq!(reply.into_text(), "/SOLU");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_download_in_chunks() {
        let mut handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        let request = ClientFrame::Call {
            id: 4,
            call: Call::DownloadFile { name: "file.rst".into(), chunk_size: 4 },
        };
        write_json(&mut writer, &request).await.unwrap();

        let mut sizes = Vec::new();
        loop {
            let payload = read_frame(&mut reader, 1024).await.unwrap().unwrap();
            match parse_json::<ServerFrame>(&payload).unwrap() {
                ServerFrame::Chunk { len, .. } => {
                    let data = read_frame(&mut reader, 1024).await.unwrap().unwrap();
                    assert_eq!(data.len(), len);
                    sizes.push(len);
                }
                ServerFrame::End { id } => {
                    assert_eq!(id, 4);
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(sizes, vec![4, 4, 2]);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let mut handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let frame = call(&mut stream, 2, Call::DownloadFile { name: "missing".into(), chunk_size: 4 }).await;
        match frame {
            ServerFrame::Error { status, .. } => assert_eq!(status.code, StatusCode::NotFound),
            other => panic!("unexpected frame: {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_invalid_json_returns_error() {
        let mut handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, b"not valid json").await.unwrap();

        let payload = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        match parse_json::<ServerFrame>(&payload).unwrap() {
            ServerFrame::Error { status, .. } => assert_eq!(status.code, StatusCode::InvalidArgument),
            other => panic!("unexpected frame: {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_exit_closes_server() {
        let handle = SolverServer::start(Arc::new(EchoService)).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        let request = ClientFrame::Call {
            id: 1,
            call: Call::Ctrl { request: "EXIT".into(), opt: None },
        };
        write_json(&mut writer, &request).await.unwrap();

        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
        assert!(handle.is_shut_down());
    }
}
