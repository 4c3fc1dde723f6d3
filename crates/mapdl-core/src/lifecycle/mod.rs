//! Session lifecycle: start the solver for a resolved configuration, hand
//! out the connection, and tear everything down in order on exit.
//!
//! Teardown order is fixed: save, background tasks, remote EXIT, local
//! processes, lock files, remote instance or HPC job, temporary run
//! location, port claim. Every step runs even when an earlier one fails;
//! failures are collected into [`TeardownErrors`].

mod backend;
mod state;

pub use state::LifecycleState;

use crate::cancel::CancellationToken;
use crate::connection::{ConnectOptions, ConnectionManager};
use crate::error::{MapdlError, Result, TeardownErrors, TeardownStep};
use crate::hpc::CommandRunner;
use crate::launcher::ReadyChecks;
use crate::options::{self, EnvSnapshot, LaunchConfig, LaunchOptions, SettingsStore};
use crate::platform;
use crate::ports::PortRegistry;
use crate::remote::DynInstanceManager;
use crate::rpc::{TcpConnector, TransportConnector};
use crate::transfer::TransferEngine;
use backend::{Backend, Endpoint};
use state::LifecycleCell;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Collaborators a session launches with.
///
/// The defaults talk to real solvers: TCP transport, the process-wide port
/// registry and scheduler commands run locally or over SSH.
#[derive(Clone)]
pub struct LaunchServices {
    /// Overrides the TCP connector built from the configuration.
    pub connector: Option<Arc<dyn TransportConnector>>,
    pub registry: Arc<PortRegistry>,
    pub ready_checks: ReadyChecks,
    pub connect: ConnectOptions,
    /// Overrides the scheduler command runner chosen from the configuration.
    pub hpc_runner: Option<Arc<dyn CommandRunner>>,
    pub instance_manager: Option<DynInstanceManager>,
    pub env: EnvSnapshot,
}

impl Default for LaunchServices {
    fn default() -> Self {
        Self {
            connector: None,
            registry: PortRegistry::global(),
            ready_checks: ReadyChecks::default(),
            connect: ConnectOptions::default(),
            hpc_runner: None,
            instance_manager: None,
            env: EnvSnapshot::from_process(),
        }
    }
}

impl LaunchServices {
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_registry(mut self, registry: Arc<PortRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_ready_checks(mut self, checks: ReadyChecks) -> Self {
        self.ready_checks = checks;
        self
    }

    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect = options;
        self
    }

    pub fn with_hpc_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.hpc_runner = Some(runner);
        self
    }

    pub fn with_instance_manager(mut self, manager: DynInstanceManager) -> Self {
        self.instance_manager = Some(manager);
        self
    }

    pub fn with_env(mut self, env: EnvSnapshot) -> Self {
        self.env = env;
        self
    }

    fn connector_for(&self, config: &LaunchConfig) -> Arc<dyn TransportConnector> {
        match &self.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(TcpConnector::new(config.max_message_length)),
        }
    }
}

impl std::fmt::Debug for LaunchServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchServices")
            .field("ready_checks", &self.ready_checks)
            .field("connect", &self.connect)
            .field("claimed_ports", &self.registry.claimed())
            .finish()
    }
}

/// How [`Session::exit_with`] ends the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitOptions {
    /// Save the solver database first.
    pub save: bool,
    /// Send EXIT even when `PYMAPDL_START_INSTANCE=false`.
    pub force: bool,
}

/// A started solver and the connection to it.
pub struct Session {
    config: LaunchConfig,
    services: LaunchServices,
    state: LifecycleCell,
    endpoint: Endpoint,
    connection: Option<ConnectionManager>,
    backend: Mutex<Backend>,
    cancel: CancellationToken,
    keep_remote_running: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.config.target)
            .field("state", &self.state.get())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Session {
    /// Start a session for a resolved configuration.
    ///
    /// On failure everything acquired so far (process, HPC job, remote
    /// instance, port claim, temporary directory) is released before the
    /// error is returned.
    pub async fn launch(config: LaunchConfig, services: LaunchServices) -> Result<Self> {
        let keep_remote_running = backend::keeps_remote_running(&services);
        let mut session = Self {
            endpoint: Endpoint {
                ip: config.ip.clone(),
                port: config.port,
            },
            config,
            services,
            state: LifecycleCell::new(),
            connection: None,
            backend: Mutex::new(Backend::Pending),
            cancel: CancellationToken::new(),
            keep_remote_running,
        };
        session.state.begin_start();
        info!("Starting MAPDL session ({:?})", session.config.target);

        let outcome = {
            let backend = session.backend.get_mut();
            backend.start(&session.config, &session.services, &session.cancel).await
        };
        match outcome {
            Ok((endpoint, connection)) => {
                session.endpoint = endpoint;
                session.connection = connection;
                session.state.mark_running();
                info!("MAPDL session running at {}:{}", session.endpoint.ip, session.endpoint.port);
                Ok(session)
            }
            Err(e) => {
                warn!("MAPDL session failed to start: {}", e);
                let mut errors = TeardownErrors::new();
                session.teardown(ExitOptions::default(), true, &mut errors).await;
                if !errors.is_empty() {
                    debug!("Cleanup after the failed start: {}", errors);
                }
                Err(e)
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn ip(&self) -> &str {
        &self.endpoint.ip
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// PID of the locally started solver.
    pub async fn pid(&self) -> Option<u32> {
        self.backend.lock().await.pid()
    }

    /// `None` for `just_launch` sessions.
    pub fn connection(&self) -> Option<&ConnectionManager> {
        self.connection.as_ref()
    }

    fn require_connection(&self) -> Result<&ConnectionManager> {
        if self.state.get() != LifecycleState::Running {
            return Err(MapdlError::SessionExited);
        }
        self.connection
            .as_ref()
            .ok_or_else(|| MapdlError::config("the session was launched without a connection"))
    }

    pub async fn run(&self, command: &str) -> Result<String> {
        self.require_connection()?.run(command).await
    }

    pub fn transfer(&self) -> Result<TransferEngine> {
        Ok(TransferEngine::for_connection(self.require_connection()?))
    }

    /// Upload a file into the solver's working directory.
    pub async fn upload(&self, local_path: &Path) -> Result<String> {
        self.transfer()?.upload(local_path, None).await
    }

    /// Download a file from the solver's working directory.
    pub async fn download(&self, remote_name: &str, local_path: &Path) -> Result<u64> {
        self.transfer()?.download(remote_name, local_path).await
    }

    /// Exit without saving. Calling it again is a no-op.
    pub async fn exit(&self) -> Result<()> {
        self.exit_with(ExitOptions::default()).await
    }

    /// Exit the session and release everything it holds.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    pub async fn exit_with(&self, options: ExitOptions) -> Result<()> {
        let mut errors = TeardownErrors::new();
        if self.teardown(options, self.config.cleanup_on_exit, &mut errors).await {
            info!("MAPDL session exited");
        }
        errors.into_result()
    }

    /// Stop supervising the solver and leave it running. Returns its PID.
    pub fn detach(mut self) -> Option<u32> {
        self.cancel.cancel();
        self.state.begin_exit();
        self.state.mark_exited();
        match std::mem::replace(self.backend.get_mut(), Backend::Pending) {
            Backend::Local { process, .. } => Some(process.detach()),
            _ => None,
        }
    }

    async fn teardown(&self, options: ExitOptions, cleanup: bool, errors: &mut TeardownErrors) -> bool {
        if !self.state.begin_exit() {
            debug!("Session already exiting or exited");
            return false;
        }
        self.cancel.cancel();

        if let Some(connection) = &self.connection {
            let send_exit = options.force || !self.keep_remote_running;
            connection.teardown(options.save, send_exit, errors).await;
        }

        if cleanup {
            self.backend.lock().await.teardown(&self.config, errors).await;
        } else {
            info!("Leaving the solver running (cleanup_on_exit is off)");
        }

        if self.config.remove_temp_dir_on_exit && self.config.run_location_is_temp {
            if let Some(dir) = &self.config.run_location {
                errors.record(TeardownStep::RemoveRunLocation, remove_run_location(dir).await);
            }
        }

        if self.config.port_claimed {
            self.services.registry.release(self.config.port);
        }

        self.state.mark_exited();
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.get() == LifecycleState::Exited {
            return;
        }
        self.cancel.cancel();
        if self.config.cleanup_on_exit {
            for pid in self.backend.get_mut().local_pids() {
                if let Err(e) = platform::kill_process(pid) {
                    warn!("Failed to kill solver process {} on drop: {}", pid, e);
                }
            }
        }
        if self.config.port_claimed {
            self.services.registry.release(self.config.port);
        }
    }
}

async fn remove_run_location(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!("Removed run location {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MapdlError::io_with_path(e, dir)),
    }
}

/// Resolve `opts` against this process's environment and cached settings,
/// then launch.
pub async fn launch_mapdl(opts: &LaunchOptions) -> Result<Session> {
    launch_mapdl_with(opts, LaunchServices::default()).await
}

pub async fn launch_mapdl_with(opts: &LaunchOptions, services: LaunchServices) -> Result<Session> {
    let settings = SettingsStore::load();
    let config = options::resolve(opts, &services.env, &settings, &services.registry)?;
    Session::launch(config, services).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpc::CommandOutput;
    use crate::options::{resolve_with, InstallationScanner};
    use crate::platform::TargetPlatform;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Scheduler that refuses every submission.
    struct RefusingScheduler;

    #[async_trait]
    impl CommandRunner for RefusingScheduler {
        async fn run(&self, _command: &str) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "sbatch: error: Batch job submission failed: Invalid account".into(),
                status: 1,
            })
        }

        fn describe(&self) -> String {
            "refusing".into()
        }
    }

    #[tokio::test]
    async fn test_failed_start_releases_port() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(PortRegistry::new());
        let opts = LaunchOptions::new()
            .with_launch_on_hpc(true)
            .with_run_location(dir.path())
            .with_port(50300);
        let config = resolve_with(
            &opts,
            &EnvSnapshot::empty(),
            &SettingsStore::empty(),
            &registry,
            &InstallationScanner::with_roots(vec![]),
            TargetPlatform::Posix,
        )
        .unwrap();
        assert!(registry.is_claimed(50300));

        let services = LaunchServices::default()
            .with_registry(registry.clone())
            .with_env(EnvSnapshot::empty())
            .with_hpc_runner(Arc::new(RefusingScheduler));
        let err = Session::launch(config, services).await.unwrap_err();

        assert!(matches!(err, MapdlError::Scheduler { .. }));
        assert!(!registry.is_claimed(50300));
        assert!(dir.path().exists(), "a user-provided run location is kept");
    }

    #[tokio::test]
    async fn test_keeps_remote_running_only_for_explicit_false() {
        let services = |pairs: Vec<(&str, &str)>| LaunchServices::default().with_env(EnvSnapshot::from_pairs(pairs));
        assert!(backend::keeps_remote_running(&services(vec![(
            crate::config::EnvVars::START_INSTANCE,
            " FALSE "
        )])));
        assert!(!backend::keeps_remote_running(&services(vec![(
            crate::config::EnvVars::START_INSTANCE,
            "true"
        )])));
        assert!(!backend::keeps_remote_running(&services(vec![])));
    }
}
