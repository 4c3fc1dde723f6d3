//! Error types for the MAPDL launcher.
//!
//! Every failure the library can report is a variant of [`MapdlError`]. The
//! variants are grouped into the categories returned by [`MapdlError::kind`],
//! so callers can decide whether to retry with different parameters, report a
//! configuration problem, or give up.

use crate::rpc::protocol::StatusCode;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the MAPDL launcher.
#[derive(Debug, Error)]
pub enum MapdlError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Conflicting options: {message}")]
    ConflictingOptions { message: String },

    #[error("Invalid value {value:?} for environment variable {name}: expected {expected}")]
    InvalidEnvVar {
        name: String,
        value: String,
        expected: String,
    },

    #[error("Unsupported MAPDL version {version}: {message}")]
    UnsupportedVersion { version: String, message: String },

    #[error("Invalid launch mode {mode:?}: {message}")]
    InvalidMode { mode: String, message: String },

    #[error("Executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    // Resource errors
    #[error("Port {port} is already used by an MAPDL instance (PID {pid})")]
    PortBusyBySolver { port: u16, pid: u32 },

    #[error("Port {port} is already used by process '{name}' (PID {pid})")]
    PortBusyByOther { port: u16, pid: u32, name: String },

    #[error("Port {port} is already in use and its owner could not be determined")]
    PortBusyUnknownOwner { port: u16 },

    #[error("Invalid port {port}: values must be between {min} and {max}")]
    InvalidPort { port: u32, min: u16, max: u16 },

    #[error("Requested {requested} CPU cores but only {available} are available")]
    NotEnoughResources { requested: u32, available: u32 },

    #[error(
        "Lock file {path:?} exists. Another MAPDL session may be using this job name \
         and directory; set `override_lock` to remove it"
    )]
    LockFileExists { path: PathBuf },

    // Launch errors
    #[error("Failed to spawn '{command}': {message}")]
    SpawnFailed {
        command: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error(
        "MAPDL did not start: {reason}\nRun location: {run_location:?}\nCommand line used: {command}\n\n\
         Terminal output:\n{output}"
    )]
    DidNotStart {
        reason: String,
        run_location: PathBuf,
        command: String,
        output: String,
    },

    #[error("Scheduler command '{command}' failed: {message}")]
    Scheduler { command: String, message: String },

    #[error("HPC job {job_id} did not reach RUNNING within {timeout:?} (last state: {state})")]
    HpcJobTimeout {
        job_id: u64,
        state: String,
        timeout: Duration,
    },

    #[error("Remote instance manager error: {message}")]
    InstanceManager { message: String },

    // Connection errors
    #[error("Could not connect to MAPDL at {addr} within {timeout:?}")]
    ConnectionTimeout { addr: String, timeout: Duration },

    #[error("Connection to MAPDL at {addr} was closed: {message}")]
    ConnectionClosed { addr: String, message: String },

    #[error("Session id mismatch: expected {expected}, remote reports {actual}")]
    SessionMismatch { expected: String, actual: String },

    #[error("MAPDL session has exited")]
    SessionExited,

    #[error("MAPDL returned {code}: {message}")]
    Remote { code: StatusCode, message: String },

    #[error("Command is {length} characters long; MAPDL accepts at most {max}")]
    CommandTooLong { length: usize, max: usize },

    #[error("Empty commands are not allowed")]
    EmptyCommand,

    #[error("Console session error: {message}")]
    Console { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Transfer errors
    #[error("Upload of '{name}' acknowledged {actual} bytes, expected {expected}")]
    TransferSizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Remote file '{name}' does not exist or is empty")]
    RemoteFileNotFound { name: String },

    #[error("Invalid chunk size {requested}: must be between 1 and {max} bytes")]
    InvalidChunkSize { requested: usize, max: usize },

    #[error("File transfer is not supported in {mode} mode")]
    TransferUnsupported { mode: String },

    // Licensing errors
    #[error("License checkout denied: {line}")]
    LicenseDenied { line: String },

    #[error("No license server reachable (tried {servers})")]
    LicenseServerUnreachable { servers: String },

    #[error("License '{license}' is not available: {message}")]
    LicenseUnavailable { license: String, message: String },

    #[error("License check did not complete within {0:?}")]
    LicenseTimeout(Duration),

    // File system and serialization errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Teardown
    #[error("{0}")]
    Teardown(TeardownErrors),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, MapdlError>;

/// Coarse category of a [`MapdlError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Resource,
    Launch,
    Connection,
    Transfer,
    Licensing,
    Io,
    Internal,
}

impl From<std::io::Error> for MapdlError {
    fn from(err: std::io::Error) -> Self {
        MapdlError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MapdlError {
    fn from(err: serde_json::Error) -> Self {
        MapdlError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MapdlError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return MapdlError::PermissionDenied(path);
        }
        MapdlError::Io {
            message: err.to_string(),
            path: Some(path),
            source: Some(err),
        }
    }

    /// Shorthand for [`MapdlError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        MapdlError::Config {
            message: message.into(),
        }
    }

    /// Shorthand for [`MapdlError::ConflictingOptions`].
    pub fn conflict(message: impl Into<String>) -> Self {
        MapdlError::ConflictingOptions {
            message: message.into(),
        }
    }

    /// The category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MapdlError::Config { .. }
            | MapdlError::ConflictingOptions { .. }
            | MapdlError::InvalidEnvVar { .. }
            | MapdlError::UnsupportedVersion { .. }
            | MapdlError::InvalidMode { .. }
            | MapdlError::ExecutableNotFound(_)
            | MapdlError::InvalidPort { .. } => ErrorKind::Configuration,

            MapdlError::PortBusyBySolver { .. }
            | MapdlError::PortBusyByOther { .. }
            | MapdlError::PortBusyUnknownOwner { .. }
            | MapdlError::NotEnoughResources { .. }
            | MapdlError::LockFileExists { .. } => ErrorKind::Resource,

            MapdlError::SpawnFailed { .. }
            | MapdlError::DidNotStart { .. }
            | MapdlError::Scheduler { .. }
            | MapdlError::HpcJobTimeout { .. }
            | MapdlError::InstanceManager { .. } => ErrorKind::Launch,

            MapdlError::ConnectionTimeout { .. }
            | MapdlError::ConnectionClosed { .. }
            | MapdlError::SessionMismatch { .. }
            | MapdlError::SessionExited
            | MapdlError::Remote { .. }
            | MapdlError::CommandTooLong { .. }
            | MapdlError::EmptyCommand
            | MapdlError::Console { .. }
            | MapdlError::Protocol { .. } => ErrorKind::Connection,

            MapdlError::TransferSizeMismatch { .. }
            | MapdlError::RemoteFileNotFound { .. }
            | MapdlError::InvalidChunkSize { .. }
            | MapdlError::TransferUnsupported { .. } => ErrorKind::Transfer,

            MapdlError::LicenseDenied { .. }
            | MapdlError::LicenseServerUnreachable { .. }
            | MapdlError::LicenseUnavailable { .. }
            | MapdlError::LicenseTimeout(_) => ErrorKind::Licensing,

            MapdlError::Io { .. } | MapdlError::PermissionDenied(_) | MapdlError::Json { .. } => {
                ErrorKind::Io
            }

            MapdlError::Teardown(errors) => errors
                .first()
                .map(|(_, err)| err.kind())
                .unwrap_or(ErrorKind::Internal),

            MapdlError::Cancelled | MapdlError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if retrying the same operation (possibly on another port) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapdlError::ConnectionTimeout { .. }
            | MapdlError::ConnectionClosed { .. }
            | MapdlError::PortBusyByOther { .. }
            | MapdlError::PortBusyUnknownOwner { .. } => true,
            MapdlError::Remote { code, .. } => *code == StatusCode::Unavailable,
            _ => false,
        }
    }

    /// True for a missing file or directory.
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(
            self,
            MapdlError::Io { source: Some(err), .. } if err.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// A teardown step of [`crate::lifecycle::Session::exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownStep {
    Save,
    RemoteExit,
    StopBackgroundTasks,
    KillProcesses,
    RemoveLockFiles,
    DeleteRemoteInstance,
    CancelHpcJob,
    RemoveRunLocation,
    ReleasePort,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeardownStep::Save => "save",
            TeardownStep::RemoteExit => "remote exit",
            TeardownStep::StopBackgroundTasks => "stop background tasks",
            TeardownStep::KillProcesses => "kill processes",
            TeardownStep::RemoveLockFiles => "remove lock files",
            TeardownStep::DeleteRemoteInstance => "delete remote instance",
            TeardownStep::CancelHpcJob => "cancel HPC job",
            TeardownStep::RemoveRunLocation => "remove run location",
            TeardownStep::ReleasePort => "release port",
        };
        f.write_str(name)
    }
}

/// Errors collected while running every teardown step.
///
/// Steps keep running after a failure. The first error is what callers
/// usually care about; the rest are kept for diagnostics.
#[derive(Debug, Default)]
pub struct TeardownErrors {
    errors: Vec<(TeardownStep, MapdlError)>,
}

impl TeardownErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a step, keeping the error if there was one.
    pub fn record(&mut self, step: TeardownStep, outcome: Result<()>) {
        if let Err(err) = outcome {
            tracing::warn!("Teardown step '{}' failed: {}", step, err);
            self.errors.push((step, err));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn first(&self) -> Option<&(TeardownStep, MapdlError)> {
        self.errors.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TeardownStep, MapdlError)> {
        self.errors.iter()
    }

    /// `Ok(())` when no step failed, otherwise [`MapdlError::Teardown`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MapdlError::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.first() {
            None => write!(f, "teardown completed"),
            Some((step, err)) => {
                write!(f, "teardown step '{}' failed: {}", step, err)?;
                if self.errors.len() > 1 {
                    write!(f, " ({} more step(s) failed)", self.errors.len() - 1)?;
                }
                Ok(())
            }
        }
    }
}
