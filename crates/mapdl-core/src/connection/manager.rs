//! The connection state machine and the calls issued over it.

use super::monitor::{self, PROBE_FUNCTION};
use super::retry::{retry_async, RetryConfig};
use super::state::{ConnectionState, StateCell};
use super::{is_loopback, Shared};
use crate::cancel::CancellationToken;
use crate::config::{LaunchDefaults, NetworkConfig, TransferConfig};
use crate::error::{MapdlError, Result, TeardownErrors, TeardownStep};
use crate::rpc::{Call, Reply, StatusCode, StreamItem, SolverTransport, TransportConnector};
use crate::options::LaunchMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Solver parameter holding the session id.
pub const SESSION_PARAMETER: &str = "__PYMAPDL_SESSION_ID__";

/// Options for [`ConnectionManager::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Total budget for reaching READY.
    pub timeout: Duration,
    /// Issue `/NERR,,,-1` after connecting.
    pub set_no_abort: bool,
    /// Heartbeat period for non-loopback peers. `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    /// Subscribe to the endpoint's health stream when it has one.
    pub health_check: bool,
    /// Store a fresh session id on the solver.
    pub create_session: bool,
    pub retry: RetryConfig,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: NetworkConfig::CONNECT_TIMEOUT,
            set_no_abort: true,
            heartbeat_interval: Some(NetworkConfig::HEARTBEAT_INTERVAL),
            health_check: true,
            create_session: true,
            retry: RetryConfig::default(),
        }
    }
}

impl ConnectOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_set_no_abort(mut self, set_no_abort: bool) -> Self {
        self.set_no_abort = set_no_abort;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_health_check(mut self, health_check: bool) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn with_create_session(mut self, create_session: bool) -> Self {
        self.create_session = create_session;
        self
    }
}

/// A connection to one solver endpoint.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    host: String,
    session_id: Mutex<Option<String>>,
    array_guard: Semaphore,
    scalar_guard: Semaphore,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    exiting: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("peer", &self.shared.transport.peer())
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Connect to `ip:port` and bring the connection to READY.
    ///
    /// The timeout is split across [`RetryConfig::max_attempts`] attempts.
    /// Within an attempt the endpoint is polled every
    /// [`NetworkConfig::CHANNEL_POLL_INTERVAL`] until it answers the
    /// channel-ready handshake.
    pub async fn connect(
        connector: Arc<dyn TransportConnector>,
        ip: &str,
        port: u16,
        options: ConnectOptions,
    ) -> Result<Self> {
        let addr = format!("{}:{}", ip, port);
        let slice = options.retry.attempt_timeout(options.timeout);
        let deadline = Instant::now() + options.timeout;
        info!("Connecting to MAPDL at {} (timeout {:?})", addr, options.timeout);

        let (outcome, stats) = retry_async(
            &options.retry,
            Some(deadline),
            |attempt| {
                let connector = connector.clone();
                let addr = addr.clone();
                async move {
                    debug!("Connection attempt {} to {}", attempt + 1, addr);
                    open_ready(connector.as_ref(), &addr, slice).await
                }
            },
            |e: &MapdlError| e.is_retryable(),
        )
        .await;

        let transport = match outcome {
            Ok(transport) => transport,
            Err(e) if e.is_retryable() => {
                debug!("Gave up on {} after {} attempts: {}", addr, stats.attempts, e);
                return Err(MapdlError::ConnectionTimeout {
                    addr,
                    timeout: options.timeout,
                });
            }
            Err(e) => return Err(e),
        };

        let manager = Self::new(transport, ip);
        manager.establish(Some((connector, addr)), &options).await?;
        Ok(manager)
    }

    /// Wrap a transport that is already open, such as a console session.
    pub async fn attach(transport: Arc<dyn SolverTransport>, options: ConnectOptions) -> Result<Self> {
        let peer = transport.peer();
        let host = peer.rsplit_once(':').map(|(host, _)| host).unwrap_or("127.0.0.1").to_string();

        match transport.unary(Call::ChannelReady).await? {
            Reply::Ready => {}
            other => {
                return Err(MapdlError::Protocol {
                    message: format!("unexpected handshake reply {:?}", other),
                })
            }
        }

        let manager = Self::new(transport, &host);
        manager.establish(None, &options).await?;
        Ok(manager)
    }

    fn new(transport: Arc<dyn SolverTransport>, host: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                state: StateCell::new(),
            }),
            host: host.to_string(),
            session_id: Mutex::new(None),
            array_guard: Semaphore::new(1),
            scalar_guard: Semaphore::new(1),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            exiting: AtomicBool::new(false),
        }
    }

    async fn establish(
        &self,
        health: Option<(Arc<dyn TransportConnector>, String)>,
        options: &ConnectOptions,
    ) -> Result<()> {
        self.shared.state.mark_ready();
        info!("Connected to MAPDL at {}", self.peer());

        if let Some(interval) = options.heartbeat_interval {
            if !is_loopback(&self.host) {
                let task = monitor::spawn_heartbeat(self.shared.clone(), interval, self.cancel.clone());
                self.push_task(task);
            }
        }

        if options.health_check && self.mode() == LaunchMode::Grpc {
            if let Some((connector, addr)) = health {
                let watch = monitor::start_health_watch(
                    connector,
                    &addr,
                    options.retry.attempt_timeout(options.timeout),
                    self.shared.clone(),
                    self.cancel.clone(),
                )
                .await?;
                if let Some(task) = watch {
                    self.push_task(task);
                }
            }
        }

        if options.set_no_abort {
            self.set_no_abort().await?;
        }
        if options.create_session {
            self.create_session().await?;
        }
        Ok(())
    }

    fn push_task(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn peer(&self) -> String {
        self.shared.transport.peer()
    }

    pub fn mode(&self) -> LaunchMode {
        self.shared.transport.mode()
    }

    /// The transport, for transfers and streamed commands.
    pub fn transport(&self) -> Arc<dyn SolverTransport> {
        self.shared.transport.clone()
    }

    /// The id stored on the solver by [`Self::create_session`].
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ConnectionState::Exited {
            return Err(MapdlError::SessionExited);
        }
        Ok(())
    }

    async fn unary(&self, call: Call) -> Result<Reply> {
        self.ensure_open()?;
        self.shared.transport.unary(call).await
    }

    /// Run one command and return its output.
    ///
    /// Commands are trimmed; empty commands and commands longer than
    /// [`LaunchDefaults::MAX_COMMAND_LENGTH`] characters are rejected locally.
    pub async fn run(&self, command: &str) -> Result<String> {
        let command = validate_command(command)?;
        debug!("Running command: {}", command);
        Ok(self
            .unary(Call::RunCommand {
                command: command.to_string(),
            })
            .await?
            .into_text())
    }

    /// Ask the solver not to abort on errors.
    pub async fn set_no_abort(&self) -> Result<()> {
        self.run("/NERR,,,-1").await.map(|_| ())
    }

    /// `/INQUIRE` a single value.
    pub async fn inquire(&self, function: &str) -> Result<String> {
        Ok(self
            .unary(Call::Inquire {
                function: function.to_string(),
            })
            .await?
            .into_text())
    }

    pub async fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.unary(Call::SetParameter {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// `*GET` a scalar. At most one scalar query is in flight per connection.
    pub async fn get_scalar(&self, query: &str) -> Result<String> {
        let _permit = self
            .scalar_guard
            .acquire()
            .await
            .map_err(|_| MapdlError::SessionExited)?;
        Ok(self
            .unary(Call::GetScalar {
                query: query.to_string(),
            })
            .await?
            .into_text())
    }

    /// Fetch a numeric array parameter. At most one array fetch is in flight
    /// per connection.
    pub async fn get_array(&self, name: &str) -> Result<Vec<f64>> {
        let _permit = self
            .array_guard
            .acquire()
            .await
            .map_err(|_| MapdlError::SessionExited)?;
        self.ensure_open()?;

        let mut raw = Vec::new();
        let mut sink = |item: StreamItem| -> Result<()> {
            match item {
                StreamItem::Chunk(bytes) => {
                    raw.extend_from_slice(&bytes);
                    Ok(())
                }
                StreamItem::Reply(reply) => Err(MapdlError::Protocol {
                    message: format!("unexpected item in array stream: {:?}", reply),
                }),
            }
        };
        self.shared
            .transport
            .server_stream(
                Call::GetArray {
                    name: name.to_string(),
                    chunk_size: TransferConfig::DEFAULT_CHUNK_SIZE,
                },
                &mut sink,
            )
            .await?;

        if raw.len() % 8 != 0 {
            return Err(MapdlError::Protocol {
                message: format!("array '{}' has {} bytes, not a whole number of values", name, raw.len()),
            });
        }
        Ok(raw
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }

    /// Store a fresh session id on the solver.
    pub async fn create_session(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.set_parameter(SESSION_PARAMETER, &id).await?;
        debug!("Session id {} stored on {}", id, self.peer());
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.clone());
        Ok(id)
    }

    /// Check that the solver still holds this connection's session id.
    pub async fn verify_session(&self) -> Result<()> {
        let Some(expected) = self.session_id() else {
            return Ok(());
        };
        let actual = self
            .get_scalar(&format!("PARM,{},VALUE", SESSION_PARAMETER))
            .await?;
        if actual.trim() != expected {
            return Err(MapdlError::SessionMismatch {
                expected,
                actual: actual.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Probe the solver. A success returns a degraded connection to READY; a
    /// failure degrades a ready one.
    pub async fn is_alive(&self) -> bool {
        if self.state() == ConnectionState::Exited {
            return false;
        }
        match self.inquire(PROBE_FUNCTION).await {
            Ok(_) => {
                self.shared.state.mark_ready();
                true
            }
            Err(e) => {
                debug!("Liveness probe to {} failed: {}", self.peer(), e);
                self.shared.state.mark_degraded();
                false
            }
        }
    }

    /// Save the solver database.
    pub async fn save(&self) -> Result<()> {
        self.run("SAVE").await.map(|_| ())
    }

    /// Send the EXIT control instruction.
    ///
    /// The endpoint closes the channel in response, so a closed-connection
    /// error here is the expected outcome.
    pub async fn send_exit(&self) -> Result<()> {
        let outcome = self
            .shared
            .transport
            .unary(Call::Ctrl {
                request: "EXIT".to_string(),
                opt: None,
            })
            .await;
        match outcome {
            Ok(_) => Ok(()),
            Err(MapdlError::ConnectionClosed { .. }) => {
                debug!("MAPDL at {} closed the channel on EXIT", self.peer());
                Ok(())
            }
            Err(MapdlError::Remote {
                code: StatusCode::Unavailable,
                ..
            }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancel and join the heartbeat and health-watch tasks.
    pub async fn stop_background_tasks(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    return Err(MapdlError::Internal(format!("background task failed: {}", e)));
                }
            }
        }
        Ok(())
    }

    /// Run the connection's teardown steps into `errors`.
    ///
    /// Returns `false` when the connection had already been torn down.
    pub async fn teardown(&self, save: bool, send_exit: bool, errors: &mut TeardownErrors) -> bool {
        if self.exiting.swap(true, Ordering::SeqCst) || self.state() == ConnectionState::Exited {
            return false;
        }
        info!("Exiting MAPDL session at {}", self.peer());

        if save {
            errors.record(TeardownStep::Save, self.save().await);
        }
        errors.record(TeardownStep::StopBackgroundTasks, self.stop_background_tasks().await);
        if send_exit {
            errors.record(TeardownStep::RemoteExit, self.send_exit().await);
        } else {
            debug!("Leaving MAPDL at {} running", self.peer());
        }

        self.shared.transport.close().await;
        self.shared.state.mark_exited();
        true
    }

    /// Exit the session. Calling it again is a no-op.
    pub async fn exit(&self, save: bool) -> Result<()> {
        let mut errors = TeardownErrors::new();
        self.teardown(save, true, &mut errors).await;
        errors.into_result()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

/// Trim a command and check it can be sent.
pub(crate) fn validate_command(command: &str) -> Result<&str> {
    let command = command.trim();
    if command.is_empty() {
        return Err(MapdlError::EmptyCommand);
    }
    let length = command.chars().count();
    if length > LaunchDefaults::MAX_COMMAND_LENGTH {
        return Err(MapdlError::CommandTooLong {
            length,
            max: LaunchDefaults::MAX_COMMAND_LENGTH,
        });
    }
    Ok(command)
}

/// Open a transport and wait for the handshake, polling until `slice` runs out.
async fn open_ready(
    connector: &dyn TransportConnector,
    addr: &str,
    slice: Duration,
) -> Result<Arc<dyn SolverTransport>> {
    let deadline = Instant::now() + slice;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = handshake(connector, addr, remaining.max(NetworkConfig::CHANNEL_POLL_INTERVAL)).await;
        match outcome {
            Ok(transport) => return Ok(transport),
            Err(e) if e.is_retryable() && Instant::now() + NetworkConfig::CHANNEL_POLL_INTERVAL < deadline => {
                tokio::time::sleep(NetworkConfig::CHANNEL_POLL_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn handshake(
    connector: &dyn TransportConnector,
    addr: &str,
    timeout: Duration,
) -> Result<Arc<dyn SolverTransport>> {
    let transport = connector.connect(addr, timeout).await?;
    let ready = tokio::time::timeout(timeout, transport.unary(Call::ChannelReady)).await;
    match ready {
        Ok(Ok(Reply::Ready)) => Ok(transport),
        Ok(Ok(other)) => {
            transport.close().await;
            Err(MapdlError::Protocol {
                message: format!("unexpected handshake reply {:?}", other),
            })
        }
        Ok(Err(e)) => {
            transport.close().await;
            Err(e)
        }
        Err(_) => {
            transport.close().await;
            warn!("No handshake from {} within {:?}", addr, timeout);
            Err(MapdlError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout,
            })
        }
    }
}
