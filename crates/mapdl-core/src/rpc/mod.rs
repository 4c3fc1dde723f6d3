//! Solver RPC.
//!
//! The solver endpoint speaks a length-prefixed JSON protocol over TCP.
//! A 4-byte big-endian length precedes every frame; raw chunk frames carry
//! file and array payloads between JSON control frames.
//!
//! # Architecture
//!
//! - **Transport**: the [`SolverTransport`] seam every session talks through
//! - **Client**: [`FramedTransport`], the TCP implementation of the seam
//! - **Server**: [`SolverServer`] dispatching to a [`SolverService`], used for
//!   loopback endpoints and tests
//! - **Console**: [`ConsoleTransport`] for solvers driven over stdin/stdout

pub mod client;
pub mod console;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::FramedTransport;
pub use console::ConsoleTransport;
pub use protocol::{Call, Reply, Status, StatusCode, StreamItem};
pub use server::{SolverServer, SolverServerHandle, SolverService, StatusResult};
pub use transport::{SolverTransport, StreamSink, TcpConnector, TransportConnector};
