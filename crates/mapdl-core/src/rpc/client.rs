//! TCP client for a solver endpoint.
//!
//! Establishes a TCP connection to the solver and exchanges framed calls
//! defined in [`super::protocol`].
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the TCP stream,
//! allowing safe concurrent use from multiple async tasks. A transport error
//! in the middle of a call drops the stream, since the framing can no longer
//! be trusted; later calls fail with `ConnectionClosed`.

use super::protocol::{
    parse_json, read_frame, write_frame, write_json, Call, ClientFrame, Reply, ServerFrame, StreamItem,
};
use super::transport::{SolverTransport, StreamSink};
use crate::error::{MapdlError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Framed solver client over one TCP connection.
#[derive(Debug)]
pub struct FramedTransport {
    stream: Mutex<Option<TcpStream>>,
    addr: String,
    next_id: AtomicU64,
    max_message_length: usize,
}

impl FramedTransport {
    /// Connect to a solver endpoint.
    pub async fn connect(addr: &str, timeout: Duration, max_message_length: usize) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MapdlError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout,
            })?
            .map_err(|e| MapdlError::ConnectionClosed {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        debug!("Solver client connected to {}", addr);

        Ok(Self {
            stream: Mutex::new(Some(stream)),
            addr: addr.to_string(),
            next_id: AtomicU64::new(1),
            max_message_length,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn closed(&self, message: impl Into<String>) -> MapdlError {
        MapdlError::ConnectionClosed {
            addr: self.addr.clone(),
            message: message.into(),
        }
    }

    /// Keep the stream after remote errors; drop it after transport errors.
    fn settle<T>(&self, slot: &mut Option<TcpStream>, outcome: Result<T>) -> Result<T> {
        match outcome {
            Err(MapdlError::Io { message, .. }) => {
                *slot = None;
                Err(self.closed(message))
            }
            Err(err @ (MapdlError::Protocol { .. } | MapdlError::Json { .. } | MapdlError::ConnectionClosed { .. })) => {
                *slot = None;
                Err(err)
            }
            other => other,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn read_server_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize, addr: &str) -> Result<ServerFrame> {
    let payload = read_frame(reader, max_len)
        .await?
        .ok_or_else(|| MapdlError::ConnectionClosed {
            addr: addr.to_string(),
            message: "connection closed by peer".to_string(),
        })?;
    parse_json(&payload)
}

fn check_id(expected: u64, actual: u64) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MapdlError::Protocol {
            message: format!("reply for call {} while waiting for call {}", actual, expected),
        })
    }
}

async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R, id: u64, max_len: usize, addr: &str) -> Result<Reply> {
    match read_server_frame(reader, max_len, addr).await? {
        ServerFrame::Reply { id: rid, reply } => {
            check_id(id, rid)?;
            Ok(reply)
        }
        ServerFrame::Error { id: rid, status } => {
            check_id(id, rid)?;
            Err(status.into())
        }
        other => Err(MapdlError::Protocol {
            message: format!("unexpected frame while waiting for a reply: {:?}", other),
        }),
    }
}

async fn exchange_stream<R, W>(
    reader: &mut R,
    writer: &mut W,
    id: u64,
    call: Call,
    sink: &mut dyn StreamSink,
    max_len: usize,
    addr: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_json(writer, &ClientFrame::Call { id, call }).await?;

    let mut sink_error = None;

    loop {
        match read_server_frame(reader, max_len, addr).await? {
            ServerFrame::Item { id: rid, reply } => {
                check_id(id, rid)?;
                deliver(sink, &mut sink_error, StreamItem::Reply(reply)).await;
            }
            ServerFrame::Chunk { id: rid, len } => {
                check_id(id, rid)?;
                let data = read_frame(reader, max_len).await?.ok_or_else(|| MapdlError::ConnectionClosed {
                    addr: addr.to_string(),
                    message: "connection closed inside a chunk".to_string(),
                })?;
                if data.len() != len {
                    return Err(MapdlError::Protocol {
                        message: format!("chunk announced {} bytes but carried {}", len, data.len()),
                    });
                }
                deliver(sink, &mut sink_error, StreamItem::Chunk(Bytes::from(data))).await;
            }
            ServerFrame::End { id: rid } => {
                check_id(id, rid)?;
                break;
            }
            ServerFrame::Error { id: rid, status } => {
                check_id(id, rid)?;
                return Err(status.into());
            }
            ServerFrame::Reply { .. } => {
                return Err(MapdlError::Protocol {
                    message: "unary reply inside a stream".to_string(),
                })
            }
        }
    }

    match sink_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Hand an item to the sink unless it has already failed.
async fn deliver(sink: &mut dyn StreamSink, sink_error: &mut Option<MapdlError>, item: StreamItem) {
    if sink_error.is_none() {
        if let Err(e) = sink.accept(item).await {
            *sink_error = Some(e);
        }
    }
}

#[async_trait]
impl SolverTransport for FramedTransport {
    fn peer(&self) -> String {
        self.addr.clone()
    }

    async fn unary(&self, call: Call) -> Result<Reply> {
        let id = self.next_id();
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(self.closed("transport is closed"));
        };
        let (mut reader, mut writer) = stream.split();

        let outcome = async {
            write_json(&mut writer, &ClientFrame::Call { id, call }).await?;
            read_reply(&mut reader, id, self.max_message_length, &self.addr).await
        }
        .await;
        self.settle(&mut guard, outcome)
    }

    async fn server_stream(&self, call: Call, sink: &mut dyn StreamSink) -> Result<()> {
        let id = self.next_id();
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(self.closed("transport is closed"));
        };
        let (mut reader, mut writer) = stream.split();

        let outcome = exchange_stream(
            &mut reader,
            &mut writer,
            id,
            call,
            sink,
            self.max_message_length,
            &self.addr,
        )
        .await;
        self.settle(&mut guard, outcome)
    }

    async fn client_stream(&self, call: Call, mut chunks: BoxStream<'_, Result<Bytes>>) -> Result<Reply> {
        let id = self.next_id();
        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(self.closed("transport is closed"));
        };
        let (mut reader, mut writer) = stream.split();

        let outcome = async {
            write_json(&mut writer, &ClientFrame::Call { id, call }).await?;

            let mut source_error = None;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => write_frame(&mut writer, &chunk).await?,
                    Err(e) => {
                        source_error = Some(e);
                        break;
                    }
                }
            }
            // An empty frame ends the upload
            write_frame(&mut writer, &[]).await?;
            let reply = read_reply(&mut reader, id, self.max_message_length, &self.addr).await;

            match source_error {
                Some(err) => Err(err),
                None => reply,
            }
        }
        .await;
        self.settle(&mut guard, outcome)
    }

    async fn close(&self) {
        if self.stream.lock().await.take().is_some() {
            debug!("Solver client to {} closed", self.addr);
        }
    }
}
