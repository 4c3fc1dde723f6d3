//! Waiting for a spawned solver to come up.

use super::process::ProcessHandle;
use super::workdir::has_error_file;
use crate::config::LaunchDefaults;
use crate::error::Result;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Checks run by [`await_ready`].
#[derive(Debug, Clone, Copy)]
pub struct ReadyChecks {
    /// Scan stdout for the gRPC server banner.
    pub banner: bool,
    pub poll_interval: Duration,
}

impl Default for ReadyChecks {
    fn default() -> Self {
        Self {
            banner: cfg!(unix) && !crate::platform::is_wsl(),
            poll_interval: LaunchDefaults::READY_POLL_INTERVAL,
        }
    }
}

/// Wait until the solver has started.
///
/// Checks, in order: the process is still alive; an `.err` file appears in
/// the run location; and, with [`ReadyChecks::banner`], stdout shows the
/// gRPC server banner. The sentinel and banner waits each get `timeout`.
/// Any failure is a [`crate::MapdlError::DidNotStart`] carrying the
/// captured output.
pub async fn await_ready(handle: &mut ProcessHandle, timeout: Duration, checks: ReadyChecks) -> Result<()> {
    debug!("Checking process {} is alive", handle.pid());
    check_alive(handle).await?;

    debug!("Waiting up to {:?} for the error file in {}", timeout, handle.run_location().display());
    let deadline = Instant::now() + timeout;
    loop {
        if has_error_file(handle.run_location()) {
            debug!("MAPDL session started (error file found)");
            break;
        }
        check_alive(handle).await?;
        if Instant::now() >= deadline {
            return Err(handle.did_not_start(
                "MAPDL failed to start. No error file (.err) generated in working directory.",
            ));
        }
        tokio::time::sleep(checks.poll_interval).await;
    }

    if !checks.banner {
        return Ok(());
    }

    debug!("Waiting up to {:?} for the gRPC server banner", timeout);
    let deadline = Instant::now() + timeout;
    loop {
        let output = handle.output();
        if output.contains(LaunchDefaults::GRPC_BANNER_START)
            && output.contains(LaunchDefaults::GRPC_BANNER_LISTENING)
        {
            debug!("MAPDL gRPC server is listening");
            return Ok(());
        }
        check_alive(handle).await?;
        if Instant::now() >= deadline {
            return Err(handle.did_not_start("MAPDL failed to start the gRPC server"));
        }
        tokio::time::sleep(checks.poll_interval).await;
    }
}

/// Output still in the pipes when the process dies is collected for this long.
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(500);

async fn check_alive(handle: &mut ProcessHandle) -> Result<()> {
    if handle.is_alive() {
        return Ok(());
    }
    handle.collect_output(EXIT_OUTPUT_GRACE).await;
    Err(handle.did_not_start("MAPDL process died."))
}
