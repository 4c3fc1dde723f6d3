//! MAPDL Core - launch, connect to and supervise MAPDL solver sessions.
//!
//! The solver is an external program. This crate finds or starts it (local
//! process, console session, SLURM job, remote instance manager, or an
//! endpoint that is already running), connects to it, moves files and
//! streamed output across the connection, and tears everything down again.
//!
//! # Example
//!
//! ```rust,ignore
//! use mapdl_core::{launch_mapdl, LaunchOptions};
//!
//! #[tokio::main]
//! async fn main() -> mapdl_core::Result<()> {
//!     let session = launch_mapdl(&LaunchOptions::new().with_nproc(2)).await?;
//!     println!("{}", session.run("/PREP7").await?);
//!     session.exit().await
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod hpc;
pub mod launcher;
pub mod licensing;
pub mod lifecycle;
pub mod options;
pub mod platform;
pub mod ports;
pub mod remote;
pub mod rpc;
pub mod transfer;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use connection::{ConnectOptions, ConnectionManager, ConnectionState};
pub use error::{ErrorKind, MapdlError, Result, TeardownErrors, TeardownStep};
pub use lifecycle::{launch_mapdl, launch_mapdl_with, ExitOptions, LaunchServices, LifecycleState, Session};
pub use options::{EnvSnapshot, LaunchConfig, LaunchMode, LaunchOptions, LaunchTarget, SettingsStore};
pub use ports::PortRegistry;
pub use transfer::{ChunkSize, TransferEngine};
