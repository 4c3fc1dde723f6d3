//! Connection to a running solver.
//!
//! [`ConnectionManager`] owns the channel to one solver endpoint and tracks
//! its [`ConnectionState`]. Connecting splits the timeout across several
//! short attempts. Once ready, a heartbeat runs for non-loopback peers and
//! a health watch runs when the endpoint offers one.

mod manager;
mod monitor;
mod retry;
mod state;

pub use manager::{ConnectOptions, ConnectionManager, SESSION_PARAMETER};
pub(crate) use manager::validate_command;
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use state::ConnectionState;

use crate::rpc::SolverTransport;
use state::StateCell;
use std::sync::Arc;

/// State shared with the background tasks.
pub(crate) struct Shared {
    pub transport: Arc<dyn SolverTransport>,
    pub state: StateCell,
}

/// True for peers on this machine, which need no heartbeat.
pub fn is_loopback(host: &str) -> bool {
    crate::config::NetworkConfig::LOOPBACK_HOSTS.contains(&host)
}
