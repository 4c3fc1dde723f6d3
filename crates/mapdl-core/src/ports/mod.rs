//! Solver port arbitration.
//!
//! - `registry` - process-wide claimed-port list behind a mutex
//! - `owner` - which OS process listens on a busy port

mod owner;
mod registry;

pub use owner::{find_owner, PortOwner};
pub use registry::PortRegistry;
