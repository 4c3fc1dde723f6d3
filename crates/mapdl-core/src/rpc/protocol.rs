//! Solver protocol types and framing.
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][payload of len bytes]
//! ```
//!
//! Payloads are UTF-8 JSON ([`ClientFrame`] from the client, [`ServerFrame`]
//! from the server), except inside binary sections. A client upload sends raw
//! chunk frames after its `call` frame and terminates them with an empty
//! frame. A server announces each raw chunk with a [`ServerFrame::Chunk`]
//! header.

use crate::error::{MapdlError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Status codes carried by error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    ResourceExhausted,
    Cancelled,
    Unimplemented,
    Unavailable,
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// An error status returned by a solver endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unimplemented(method: &str) -> Self {
        Self::new(StatusCode::Unimplemented, format!("Method not found: {}", method))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }
}

impl From<Status> for MapdlError {
    fn from(status: Status) -> Self {
        MapdlError::Remote {
            code: status.code,
            message: status.message,
        }
    }
}

/// A call issued by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    /// Handshake; answered with [`Reply::Ready`].
    ChannelReady,
    /// Control instruction such as `EXIT` or `VERSION`.
    Ctrl {
        request: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        opt: Option<String>,
    },
    RunCommand { command: String },
    /// Server stream of [`Reply::Text`] pieces.
    RunStreamed {
        command: String,
        flush_interval_ms: u64,
    },
    /// Server stream of [`Reply::Text`] pieces for an input file already on the server.
    InputStreamed {
        file: String,
        flush_interval_ms: u64,
    },
    /// Cheap inquiry such as `JOBNAME`.
    Inquire { function: String },
    SetParameter { name: String, value: String },
    GetScalar { query: String },
    /// Server stream of little-endian `f64` chunks.
    GetArray { name: String, chunk_size: usize },
    /// Client stream of raw chunks, answered with [`Reply::Ack`].
    UploadFile { name: String },
    /// Server stream of raw chunks.
    DownloadFile { name: String, chunk_size: usize },
    /// Server stream of [`Reply::Health`] updates.
    HealthWatch,
}

impl Call {
    /// Method name used in logs and unimplemented errors.
    pub fn method(&self) -> &'static str {
        match self {
            Call::ChannelReady => "channel_ready",
            Call::Ctrl { .. } => "ctrl",
            Call::RunCommand { .. } => "run_command",
            Call::RunStreamed { .. } => "run_streamed",
            Call::InputStreamed { .. } => "input_streamed",
            Call::Inquire { .. } => "inquire",
            Call::SetParameter { .. } => "set_parameter",
            Call::GetScalar { .. } => "get_scalar",
            Call::GetArray { .. } => "get_array",
            Call::UploadFile { .. } => "upload_file",
            Call::DownloadFile { .. } => "download_file",
            Call::HealthWatch => "health_watch",
        }
    }
}

/// A successful reply or stream item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    Empty,
    Text { text: String },
    Scalar { value: String },
    Ack { bytes: u64 },
    Health { serving: bool },
}

impl Reply {
    /// The text of a `Text` or `Scalar` reply; empty otherwise.
    pub fn into_text(self) -> String {
        match self {
            Reply::Text { text } => text,
            Reply::Scalar { value } => value,
            _ => String::new(),
        }
    }
}

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    Call { id: u64, call: Call },
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to a unary or client-stream call.
    Reply { id: u64, reply: Reply },
    /// One item of a server stream.
    Item { id: u64, reply: Reply },
    /// Header of a raw chunk; the next frame carries `len` bytes.
    Chunk { id: u64, len: usize },
    /// End of a server stream.
    End { id: u64 },
    Error { id: u64, status: Status },
}

/// One element of a server stream as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Reply(Reply),
    Chunk(bytes::Bytes),
}

/// Read a length-prefixed frame.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(MapdlError::Protocol {
            message: format!("message size {} exceeds maximum {}", len, max_len),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| MapdlError::Protocol {
        message: format!("message size {} does not fit a frame", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize and write a JSON frame.
pub async fn write_json<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)?;
    write_frame(writer, &bytes).await
}

/// Parse a JSON frame payload.
pub fn parse_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| MapdlError::Json {
        message: format!("Failed to parse solver frame: {}", e),
        source: Some(e),
    })
}
