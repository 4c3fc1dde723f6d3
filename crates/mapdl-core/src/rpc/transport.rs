//! The client seam between a session and its solver endpoint.

use super::client::FramedTransport;
use super::protocol::{Call, Reply, StreamItem};
use crate::error::Result;
use crate::options::LaunchMode;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Receives the items of a server stream in order.
///
/// The transport awaits each `accept` before reading the next frame, so a
/// slow sink slows the stream down. Returning an error does not stop the
/// stream: the transport keeps reading until the server ends it and then
/// reports the first error.
#[async_trait]
pub trait StreamSink: Send {
    async fn accept(&mut self, item: StreamItem) -> Result<()>;
}

#[async_trait]
impl<F> StreamSink for F
where
    F: FnMut(StreamItem) -> Result<()> + Send,
{
    async fn accept(&mut self, item: StreamItem) -> Result<()> {
        self(item)
    }
}

/// A channel to a solver endpoint.
///
/// Calls on one transport are serialized: a call holds the channel until its
/// reply (or the end of its stream) has been read.
#[async_trait]
pub trait SolverTransport: Send + Sync {
    /// `host:port` or a description of the peer.
    fn peer(&self) -> String;

    /// The kind of session this transport speaks to.
    fn mode(&self) -> LaunchMode {
        LaunchMode::Grpc
    }

    /// One request, one reply.
    async fn unary(&self, call: Call) -> Result<Reply>;

    /// One request, a stream of replies, drained to the end.
    async fn server_stream(&self, call: Call, sink: &mut dyn StreamSink) -> Result<()>;

    /// One request followed by raw chunks, one reply.
    async fn client_stream(&self, call: Call, chunks: BoxStream<'_, Result<Bytes>>) -> Result<Reply>;

    /// Close the channel. Later calls fail with a connection error.
    async fn close(&self);
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<Arc<dyn SolverTransport>>;
}

/// Connects [`FramedTransport`]s over TCP.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    max_message_length: usize,
}

impl TcpConnector {
    pub fn new(max_message_length: usize) -> Self {
        Self { max_message_length }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(crate::config::NetworkConfig::MAX_MESSAGE_LENGTH)
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, addr: &str, timeout: Duration) -> Result<Arc<dyn SolverTransport>> {
        let transport = FramedTransport::connect(addr, timeout, self.max_message_length).await?;
        Ok(Arc::new(transport))
    }
}
