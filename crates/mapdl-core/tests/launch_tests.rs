//! Local launch tests with a shell script standing in for the solver binary.
//!
//! The script writes the `.err` sentinel and prints the gRPC banner, then
//! sleeps. The protocol side is served by an in-process stand-in bound to
//! the port the launcher allocated.

#![cfg(unix)]

mod common;

use common::{resolve, services, FakeSolver};
use mapdl_core::launcher::ReadyChecks;
use mapdl_core::platform::is_process_alive;
use mapdl_core::rpc::SolverServer;
use mapdl_core::{EnvSnapshot, LaunchOptions, LaunchTarget, LifecycleState, MapdlError, PortRegistry, Session};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const GOOD_SOLVER: &str = r#"#!/bin/sh
echo "START GRPC SERVER"
touch "$2"0.err
echo "Server listening on 127.0.0.1"
exec sleep 60
"#;

const SILENT_SOLVER: &str = "#!/bin/sh\nexec sleep 60\n";

const CRASHING_SOLVER: &str = "#!/bin/sh\necho 'license checkout failed' >&2\nexit 3\n";

/// Write `script` where the launcher expects a 2022 R2 executable.
fn install_solver(root: &Path, script: &str) -> PathBuf {
    let exec = root.join("v222").join("ansys").join("bin").join("ansys222");
    std::fs::create_dir_all(exec.parent().unwrap()).unwrap();
    std::fs::write(&exec, script).unwrap();
    std::fs::set_permissions(&exec, std::fs::Permissions::from_mode(0o755)).unwrap();
    exec
}

fn launch_options(exec: &Path, run: &Path, timeout: Duration) -> LaunchOptions {
    LaunchOptions::new()
        .with_exec_file(exec)
        .with_run_location(run)
        .with_nproc(1)
        .with_start_timeout(timeout)
}

fn fast_checks() -> ReadyChecks {
    ReadyChecks {
        banner: true,
        poll_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn test_local_launch_reaches_ready() {
    let temp = TempDir::new().unwrap();
    let exec = install_solver(temp.path(), GOOD_SOLVER);
    let run = temp.path().join("run");
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::with_default_port(common::free_port()));

    let config = resolve(&launch_options(&exec, &run, Duration::from_secs(10)), &env, &registry).unwrap();
    assert_eq!(config.target, LaunchTarget::LocalGrpc);
    assert!(registry.is_claimed(config.port));

    let solver = Arc::new(FakeSolver::default());
    let _server = SolverServer::bind(&format!("127.0.0.1:{}", config.port), solver.clone())
        .await
        .unwrap();

    let port = config.port;
    let session = Session::launch(config, services(registry.clone(), env).with_ready_checks(fast_checks()))
        .await
        .unwrap();
    let pid = session.pid().await.unwrap();
    assert!(is_process_alive(pid));
    assert!(run.join("file0.err").exists());
    assert_eq!(session.state(), LifecycleState::Running);
    assert!(solver.ran("/NERR,,,-1"));

    std::fs::write(run.join("file.lock"), "").unwrap();
    session.exit().await.unwrap();

    assert!(!is_process_alive(pid));
    assert!(!run.join("file.lock").exists());
    assert!(!registry.is_claimed(port));

    // A second exit changes nothing
    session.exit().await.unwrap();
    assert!(!registry.is_claimed(port));
}

#[tokio::test]
async fn test_lock_file_blocks_launch_without_override() {
    let temp = TempDir::new().unwrap();
    let exec = install_solver(temp.path(), GOOD_SOLVER);
    let run = temp.path().join("run");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("file.lock"), "").unwrap();
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::with_default_port(common::free_port()));

    let config = resolve(&launch_options(&exec, &run, Duration::from_secs(5)), &env, &registry).unwrap();
    let err = Session::launch(config, services(registry.clone(), env)).await.unwrap_err();

    assert!(matches!(err, MapdlError::LockFileExists { .. }));
    assert!(run.join("file.lock").exists());
    assert!(!run.join("file0.err").exists(), "no process may be spawned");
    assert!(registry.claimed().is_empty());
}

#[tokio::test]
async fn test_lock_file_override_removes_it() {
    let temp = TempDir::new().unwrap();
    let exec = install_solver(temp.path(), GOOD_SOLVER);
    let run = temp.path().join("run");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("file.lock"), "").unwrap();
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::with_default_port(common::free_port()));

    let opts = launch_options(&exec, &run, Duration::from_secs(10))
        .with_override_lock(true)
        .with_just_launch(true);
    let config = resolve(&opts, &env, &registry).unwrap();
    let session = Session::launch(config, services(registry, env).with_ready_checks(fast_checks()))
        .await
        .unwrap();

    assert!(session.connection().is_none());
    assert!(run.join("file0.err").exists());
    session.exit().await.unwrap();
}

#[tokio::test]
async fn test_missing_sentinel_times_out() {
    let temp = TempDir::new().unwrap();
    let exec = install_solver(temp.path(), SILENT_SOLVER);
    let run = temp.path().join("run");
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::with_default_port(common::free_port()));

    let timeout = Duration::from_millis(800);
    let config = resolve(&launch_options(&exec, &run, timeout), &env, &registry).unwrap();

    let started = Instant::now();
    let err = Session::launch(config, services(registry.clone(), env).with_ready_checks(fast_checks()))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        MapdlError::DidNotStart { reason, command, .. } => {
            assert!(reason.contains(".err"), "unexpected reason: {}", reason);
            assert!(command.contains("-grpc"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_secs(3));
    assert!(registry.claimed().is_empty());
}

#[tokio::test]
async fn test_crashing_solver_reports_output() {
    let temp = TempDir::new().unwrap();
    let exec = install_solver(temp.path(), CRASHING_SOLVER);
    let run = temp.path().join("run");
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::with_default_port(common::free_port()));

    let config = resolve(&launch_options(&exec, &run, Duration::from_secs(5)), &env, &registry).unwrap();
    let err = Session::launch(config, services(registry, env).with_ready_checks(fast_checks()))
        .await
        .unwrap_err();

    match err {
        MapdlError::DidNotStart { reason, output, .. } => {
            assert!(reason.contains("died"), "unexpected reason: {}", reason);
            assert!(output.contains("license checkout failed"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
