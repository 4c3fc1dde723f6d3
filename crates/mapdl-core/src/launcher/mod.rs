//! Local solver launch.
//!
//! Provides:
//! - Command lines for gRPC and console sessions
//! - Spawning with background output drains
//! - Readiness detection (process alive, `.err` sentinel, server banner)
//! - Run-directory arbitration (lock files, cleanup scripts)

mod command;
mod process;
mod ready;
pub mod workdir;

pub use command::{build_command, display_command, ram_megabytes, CommandSpec};
pub use process::{OutputLog, ProcessHandle, SpawnRequest, StdioMode};
pub use ready::{await_ready, ReadyChecks};

use crate::error::{MapdlError, Result};
use crate::options::{LaunchConfig, LaunchMode};
use crate::platform::TargetPlatform;
use tracing::info;

/// Spawn the solver described by a local launch configuration.
///
/// Checks the lock file first and never spawns over one that is kept. A
/// gRPC solver is awaited with [`await_ready`]; a console solver is returned
/// with its stdin/stdout untouched so the caller can wait for its prompt.
pub async fn launch_local(config: &LaunchConfig, checks: ReadyChecks) -> Result<ProcessHandle> {
    let run_location = config
        .run_location
        .as_deref()
        .ok_or_else(|| MapdlError::config("a local launch needs a run location"))?;
    let spec = CommandSpec::from_config(config)
        .ok_or_else(|| MapdlError::config("a local launch needs an executable"))?;

    workdir::check_lock_file(run_location, &config.jobname, config.override_lock)?;

    let platform = TargetPlatform::current();
    if platform.is_windows() && config.mode == LaunchMode::Grpc {
        workdir::write_windows_input(run_location)?;
    }

    let argv = spec.build(platform);
    let stdio = match config.mode {
        LaunchMode::Grpc => StdioMode::Drained,
        LaunchMode::Console => StdioMode::Interactive,
    };

    let mut handle = ProcessHandle::spawn(SpawnRequest {
        argv: &argv,
        run_location,
        jobname: &config.jobname,
        env: &config.env,
        stdio,
        output_file: config.mapdl_output.as_deref(),
    })?;

    if config.mode == LaunchMode::Grpc {
        if let Err(e) = await_ready(&mut handle, config.start_timeout, checks).await {
            let _ = handle.kill().await;
            return Err(e);
        }
        info!(
            "MAPDL (PID {}) is up at {}",
            handle.pid(),
            config.endpoint()
        );
    }

    Ok(handle)
}
