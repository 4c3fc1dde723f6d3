//! Console sessions: the solver driven line by line over its stdin/stdout.
//!
//! Each command is written as one line and the output is read until the
//! solver prints one of its routine prompts (`BEGIN:`, `PREP7:`, ...).
//! Confirmation prompts are answered with `y`; the suspend-processing prompt
//! and format prompts are errors.

use super::protocol::{Call, Reply, StreamItem};
use super::transport::{SolverTransport, StreamSink};
use crate::error::{MapdlError, Result};
use crate::options::LaunchMode;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

static READY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(BEGIN:|PREP7:|SOLU_LS[0-9]+:|POST1:|POST26:|RUNSTAT:|AUX2:|AUX3:|AUX12:|AUX15:)\s*$")
        .expect("console prompt regex must compile")
});
static CONTINUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(YES,NO OR CONTINUOUS\)=|executed\?)\s*$").expect("console continue regex must compile")
});
static SUSPEND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"SHOULD INPUT PROCESSING BE SUSPENDED\?").expect("console suspend regex must compile")
});
static FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ENTER FORMAT for").expect("console format regex must compile"));

/// Name of the scratch parameter used for scalar queries.
const SCALAR_PARAMETER: &str = "__MAPDL_SCALAR__";

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct ConsoleIo {
    reader: Reader,
    writer: Writer,
    closed: bool,
}

/// Console-mode session over a child's stdin/stdout.
pub struct ConsoleTransport {
    io: Mutex<ConsoleIo>,
    label: String,
}

impl std::fmt::Debug for ConsoleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleTransport").field("label", &self.label).finish()
    }
}

impl ConsoleTransport {
    /// Wrap the solver's stdout (`reader`) and stdin (`writer`).
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        label: impl Into<String>,
    ) -> Self {
        Self {
            io: Mutex::new(ConsoleIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                closed: false,
            }),
            label: label.into(),
        }
    }

    fn error(&self, message: impl Into<String>) -> MapdlError {
        MapdlError::Console {
            message: message.into(),
        }
    }

    /// Wait for the first `BEGIN:` prompt, answering a `CONTINUE` prompt.
    pub async fn wait_for_begin(&self, timeout: Duration) -> Result<String> {
        debug!("Waiting up to {:?} for the console BEGIN prompt", timeout);
        let mut io = self.io.lock().await;
        let io = &mut *io;
        let mut output = String::new();
        let mut answered = false;

        let waited = tokio::time::timeout(timeout, async {
            let mut buf = [0u8; 4096];
            loop {
                let n = io.reader.read(&mut buf).await?;
                if n == 0 {
                    return Err(self.error(format!("console closed before BEGIN:\n{}", output)));
                }
                output.push_str(&String::from_utf8_lossy(&buf[..n]));
                if output.contains("BEGIN:") {
                    return Ok(());
                }
                if !answered && output.contains("CONTINUE") {
                    io.writer.write_all(b"\n").await?;
                    io.writer.flush().await?;
                    answered = true;
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {
                info!("Console session ready");
                Ok(output)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.error(format!(
                "no BEGIN: prompt within {:?}. Output so far:\n{}",
                timeout, output
            ))),
        }
    }

    /// Run one command and return its output without the trailing prompt.
    pub async fn run(&self, command: &str) -> Result<String> {
        let mut io = self.io.lock().await;
        if io.closed {
            return Err(self.error("console session is closed"));
        }
        let io = &mut *io;

        io.writer.write_all(command.trim_end().as_bytes()).await?;
        io.writer.write_all(b"\n").await?;
        io.writer.flush().await?;

        let mut output = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = io.reader.read(&mut buf).await?;
            if n == 0 {
                io.closed = true;
                return Err(MapdlError::ConnectionClosed {
                    addr: self.label.clone(),
                    message: "console output ended".to_string(),
                });
            }
            output.push_str(&String::from_utf8_lossy(&buf[..n]));

            if let Some(m) = READY_RE.find(&output) {
                output.truncate(m.start());
                return Ok(output.trim_end().to_string());
            }
            if CONTINUE_RE.is_match(&output) {
                io.writer.write_all(b"y\n").await?;
                io.writer.flush().await?;
                continue;
            }
            if SUSPEND_RE.is_match(&output) {
                return Err(self.error(format!("error while running '{}':\n{}", command, output)));
            }
            if FORMAT_RE.is_match(&output) {
                return Err(self.error(format!("'{}' expects user input:\n{}", command, output)));
            }
        }
    }

    async fn exit(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if io.closed {
            return Ok(());
        }
        io.writer.write_all(b"FINISH\nEXIT\n").await?;
        io.writer.flush().await?;
        io.closed = true;
        info!("Console session asked to exit");
        Ok(())
    }

    async fn get_scalar(&self, query: &str) -> Result<String> {
        self.run(&format!("*GET,{},{}", SCALAR_PARAMETER, query)).await?;
        self.read_scalar(query).await
    }

    async fn inquire(&self, function: &str) -> Result<String> {
        self.run(&format!("/INQUIRE,{},{}", SCALAR_PARAMETER, function)).await?;
        self.read_scalar(function).await
    }

    async fn read_scalar(&self, what: &str) -> Result<String> {
        let status = self.run(&format!("*STATUS,{}", SCALAR_PARAMETER)).await?;
        parse_status_value(&status, SCALAR_PARAMETER)
            .ok_or_else(|| self.error(format!("could not read '{}' from:\n{}", what, status)))
    }
}

/// Value column of the `*STATUS` row for `name`.
fn parse_status_value(status: &str, name: &str) -> Option<String> {
    let name = name.to_uppercase();
    status
        .lines()
        .filter(|line| line.trim_start().starts_with(&name))
        .last()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|value| value.trim_matches('\'').to_string())
}

#[async_trait]
impl SolverTransport for ConsoleTransport {
    fn peer(&self) -> String {
        self.label.clone()
    }

    fn mode(&self) -> LaunchMode {
        LaunchMode::Console
    }

    async fn unary(&self, call: Call) -> Result<Reply> {
        match call {
            Call::ChannelReady => Ok(Reply::Ready),
            Call::Ctrl { request, .. } if request.eq_ignore_ascii_case("exit") => {
                self.exit().await.map(|_| Reply::Empty)
            }
            Call::Ctrl { request, .. } => Err(self.error(format!(
                "control request '{}' is not available in console mode",
                request
            ))),
            Call::RunCommand { command } => self.run(&command).await.map(|text| Reply::Text { text }),
            Call::Inquire { function } => self.inquire(&function).await.map(|text| Reply::Text { text }),
            Call::SetParameter { name, value } => self
                .run(&format!("*SET,{},'{}'", name, value))
                .await
                .map(|_| Reply::Empty),
            Call::GetScalar { query } => self.get_scalar(&query).await.map(|value| Reply::Scalar { value }),
            other => Err(MapdlError::TransferUnsupported {
                mode: format!("console ({})", other.method()),
            }),
        }
    }

    async fn server_stream(&self, call: Call, sink: &mut dyn StreamSink) -> Result<()> {
        match call {
            Call::RunStreamed { command, .. } => {
                let text = self.run(&command).await?;
                sink.accept(StreamItem::Reply(Reply::Text { text })).await
            }
            other => Err(MapdlError::TransferUnsupported {
                mode: format!("console ({})", other.method()),
            }),
        }
    }

    async fn client_stream(&self, call: Call, _chunks: BoxStream<'_, Result<Bytes>>) -> Result<Reply> {
        Err(MapdlError::TransferUnsupported {
            mode: format!("console ({})", call.method()),
        })
    }

    async fn close(&self) {
        self.io.lock().await.closed = true;
    }
}
