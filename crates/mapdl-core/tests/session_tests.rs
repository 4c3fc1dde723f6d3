//! Integration tests for sessions against a solver stand-in.
//!
//! Each test starts a `SolverServer` on loopback and drives a `Session`
//! through its public interface.

mod common;

use async_trait::async_trait;
use common::{resolve, services, start_solver, FakeSolver};
use mapdl_core::config::EnvVars;
use mapdl_core::hpc::{CommandOutput, CommandRunner};
use mapdl_core::options::SolverVersion;
use mapdl_core::remote::{InstanceManager, RemoteInstance};
use mapdl_core::{
    ConnectionState, EnvSnapshot, ExitOptions, LaunchOptions, LaunchTarget, LifecycleState, MapdlError,
    PortRegistry, Session,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn remote_options(port: u16) -> LaunchOptions {
    LaunchOptions::new()
        .with_start_instance(false)
        .with_ip("127.0.0.1")
        .with_port(port)
}

#[tokio::test]
async fn test_remote_connect_without_start() {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver.clone()).await;
    let registry = Arc::new(PortRegistry::new());
    let env = EnvSnapshot::empty();

    let config = resolve(&remote_options(server.port()), &env, &registry).unwrap();
    assert_eq!(config.target, LaunchTarget::RemoteEndpoint);
    assert!(config.exec_file.is_none());

    let session = Session::launch(config, services(registry.clone(), env)).await.unwrap();
    assert_eq!(session.state(), LifecycleState::Running);
    assert_eq!(session.pid().await, None);
    assert_eq!(session.connection().unwrap().state(), ConnectionState::Ready);
    assert!(solver.ran("/NERR,,,-1"));

    let output = session.run("/PREP7").await.unwrap();
    assert_eq!(output, "ran /PREP7");
    session.connection().unwrap().verify_session().await.unwrap();

    session.exit().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Exited);
    assert!(registry.claimed().is_empty());
}

#[tokio::test]
async fn test_exit_twice_is_a_noop() {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver).await;
    let registry = Arc::new(PortRegistry::new());
    let env = EnvSnapshot::empty();
    let config = resolve(&remote_options(server.port()), &env, &registry).unwrap();
    let session = Session::launch(config, services(registry, env)).await.unwrap();

    session.exit_with(ExitOptions { save: true, force: false }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.is_shut_down());

    session.exit().await.unwrap();
    assert_eq!(session.state(), LifecycleState::Exited);
    assert!(matches!(session.run("/SOLU").await, Err(MapdlError::SessionExited)));
}

#[tokio::test]
async fn test_start_instance_false_keeps_remote_running() {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver).await;
    let registry = Arc::new(PortRegistry::new());
    let env = EnvSnapshot::from_pairs([(EnvVars::START_INSTANCE, "false"), (EnvVars::IP, "127.0.0.1")]);
    let opts = LaunchOptions::new().with_port(server.port());

    let config = resolve(&opts, &env, &registry).unwrap();
    assert!(!config.start_instance);
    let session = Session::launch(config.clone(), services(registry.clone(), env.clone()))
        .await
        .unwrap();
    session.exit().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!server.is_shut_down());

    let session = Session::launch(config, services(registry, env)).await.unwrap();
    session
        .exit_with(ExitOptions { save: false, force: true })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.is_shut_down());
}

#[tokio::test]
async fn test_connect_timeout_to_silent_port() {
    let registry = Arc::new(PortRegistry::new());
    let env = EnvSnapshot::empty();
    let port = common::free_port();
    let config = resolve(&remote_options(port), &env, &registry).unwrap();

    let services = services(registry, env).with_connect_options(
        mapdl_core::ConnectOptions::default().with_timeout(Duration::from_millis(500)),
    );
    let started = std::time::Instant::now();
    let err = Session::launch(config, services).await.unwrap_err();
    assert!(matches!(err, MapdlError::ConnectionTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_session_transfers() {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver.clone()).await;
    let registry = Arc::new(PortRegistry::new());
    let env = EnvSnapshot::empty();
    let config = resolve(&remote_options(server.port()), &env, &registry).unwrap();
    let session = Session::launch(config, services(registry, env)).await.unwrap();

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("model.cdb");
    let content = vec![42u8; 600 * 1024];
    std::fs::write(&local, &content).unwrap();

    let name = session.upload(&local).await.unwrap();
    assert_eq!(name, "model.cdb");
    assert_eq!(solver.files.lock().unwrap()["model.cdb"].len(), content.len());

    let back = dir.path().join("back.cdb");
    assert_eq!(session.download("model.cdb", &back).await.unwrap(), content.len() as u64);
    assert_eq!(std::fs::read(&back).unwrap(), content);

    let err = session.download("missing.rst", &dir.path().join("missing.rst")).await.unwrap_err();
    assert!(matches!(err, MapdlError::RemoteFileNotFound { .. }));

    session.exit().await.unwrap();
}

/// Instance manager handing out the address of the stand-in.
struct StaticManager {
    address: String,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl InstanceManager for StaticManager {
    fn describe(&self) -> String {
        "static".into()
    }

    async fn create_instance(
        &self,
        product: &str,
        _version: Option<SolverVersion>,
    ) -> mapdl_core::Result<RemoteInstance> {
        Ok(RemoteInstance {
            name: format!("instances/{}-test", product),
            address: self.address.clone(),
            ready: false,
        })
    }

    async fn wait_for_ready(&self, instance: &RemoteInstance, _timeout: Duration) -> mapdl_core::Result<RemoteInstance> {
        Ok(RemoteInstance {
            ready: true,
            ..instance.clone()
        })
    }

    async fn delete_instance(&self, instance: &RemoteInstance) -> mapdl_core::Result<()> {
        self.deleted.lock().unwrap().push(instance.name.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_instance_manager_session() {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver).await;
    let dir = TempDir::new().unwrap();
    let pim_config = dir.path().join("pim.json");
    std::fs::write(&pim_config, r#"{"version": 1, "pim": {"uri": "dns:pim.local:443"}}"#).unwrap();

    let env = EnvSnapshot::from_pairs([(EnvVars::INSTANCE_MANAGER_CONFIG, pim_config.to_string_lossy())]);
    let registry = Arc::new(PortRegistry::new());
    let config = resolve(&LaunchOptions::new(), &env, &registry).unwrap();
    assert_eq!(config.target, LaunchTarget::RemoteInstanceManager);

    let manager = Arc::new(StaticManager {
        address: format!("dns:127.0.0.1:{}", server.port()),
        deleted: Mutex::new(Vec::new()),
    });
    let session = Session::launch(config, services(registry, env).with_instance_manager(manager.clone()))
        .await
        .unwrap();
    assert_eq!(session.port(), server.port());

    session.exit().await.unwrap();
    assert_eq!(*manager.deleted.lock().unwrap(), vec!["instances/mapdl-test".to_string()]);
}

/// Scheduler that starts every job immediately on loopback.
#[derive(Default)]
struct InstantScheduler {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for InstantScheduler {
    async fn run(&self, command: &str) -> mapdl_core::Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let stdout = if command.starts_with("sbatch") {
            "Submitted batch job 77\n".to_string()
        } else if command.starts_with("scontrol") {
            "JobId=77 JobName=wrap\n   JobState=RUNNING Reason=None\n   BatchHost=127.0.0.1\n".to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            status: 0,
        })
    }

    fn describe(&self) -> String {
        "instant".into()
    }
}

impl InstantScheduler {
    fn ran(&self, prefix: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c.starts_with(prefix))
    }
}

async fn hpc_session(finish_job_on_exit: bool) -> (Arc<InstantScheduler>, Session, TempDir, mapdl_core::rpc::SolverServerHandle) {
    let solver = Arc::new(FakeSolver::default());
    let server = start_solver(solver).await;
    let dir = TempDir::new().unwrap();
    let env = EnvSnapshot::empty();
    let registry = Arc::new(PortRegistry::new());

    let opts = LaunchOptions::new()
        .with_launch_on_hpc(true)
        .with_exec_file("/ansys_inc/v222/ansys/bin/ansys222")
        .with_run_location(dir.path())
        .with_port(server.port())
        .with_finish_job_on_exit(finish_job_on_exit);
    let config = resolve(&opts, &env, &registry).unwrap();
    assert_eq!(config.target, LaunchTarget::Hpc);

    let scheduler = Arc::new(InstantScheduler::default());
    let session = Session::launch(config, services(registry, env).with_hpc_runner(scheduler.clone()))
        .await
        .unwrap();
    (scheduler, session, dir, server)
}

#[tokio::test]
async fn test_hpc_session_cancels_job_on_exit() {
    let (scheduler, session, _dir, _server) = hpc_session(true).await;
    assert_eq!(session.ip(), "127.0.0.1");
    assert!(scheduler.ran("sbatch"));

    session.exit().await.unwrap();
    assert!(scheduler.ran("scancel 77"));
}

#[tokio::test]
async fn test_hpc_session_can_leave_job_running() {
    let (scheduler, session, _dir, _server) = hpc_session(false).await;
    session.exit().await.unwrap();
    assert!(!scheduler.ran("scancel"));
}
