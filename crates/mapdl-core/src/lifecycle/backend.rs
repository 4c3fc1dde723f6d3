//! One backend per launch target.

use super::LaunchServices;
use crate::cancel::CancellationToken;
use crate::config::{EnvVars, LicenseConfig};
use crate::connection::{ConnectOptions, ConnectionManager};
use crate::error::{MapdlError, Result, TeardownErrors, TeardownStep};
use crate::hpc::{self, HpcJob};
use crate::launcher::{self, workdir, CommandSpec, ProcessHandle};
use crate::licensing::{self, LicenseChecker};
use crate::options::{LaunchConfig, LaunchTarget};
use crate::platform::{self, TargetPlatform};
use crate::remote::{self, DynInstanceManager, InstanceManagerConfig, RemoteInstance};
use crate::rpc::ConsoleTransport;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a session owns besides its connection.
pub(crate) enum Backend {
    /// Nothing acquired yet.
    Pending,
    /// A solver spawned on this machine, gRPC or console.
    Local {
        process: ProcessHandle,
        /// Extra solver PIDs named by the cleanup script.
        cleanup_pids: Vec<u32>,
    },
    /// An endpoint someone else started.
    Remote,
    Hpc { job: HpcJob },
    Managed {
        manager: DynInstanceManager,
        instance: RemoteInstance,
    },
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Pending => f.write_str("Pending"),
            Backend::Local { process, cleanup_pids } => f
                .debug_struct("Local")
                .field("pid", &process.pid())
                .field("cleanup_pids", cleanup_pids)
                .finish(),
            Backend::Remote => f.write_str("Remote"),
            Backend::Hpc { job } => f.debug_struct("Hpc").field("job_id", &job.job_id()).finish(),
            Backend::Managed { instance, .. } => {
                f.debug_struct("Managed").field("instance", &instance.name).finish()
            }
        }
    }
}

/// Where the solver ended up listening.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Backend {
    pub fn pid(&self) -> Option<u32> {
        match self {
            Backend::Local { process, .. } => Some(process.pid()),
            _ => None,
        }
    }

    /// Start the solver for `config.target` and, unless `just_launch`,
    /// connect to it.
    ///
    /// Whatever was acquired before a failure is left in `self` so the
    /// caller's teardown can release it.
    pub async fn start(
        &mut self,
        config: &LaunchConfig,
        services: &LaunchServices,
        cancel: &CancellationToken,
    ) -> Result<(Endpoint, Option<ConnectionManager>)> {
        match config.target {
            LaunchTarget::LocalGrpc => self.start_local_grpc(config, services).await,
            LaunchTarget::LocalConsole => self.start_local_console(config, services).await,
            LaunchTarget::RemoteEndpoint => {
                *self = Backend::Remote;
                let endpoint = Endpoint {
                    ip: config.ip.clone(),
                    port: config.port,
                };
                let connection = connect(config, services, &endpoint).await?;
                Ok((endpoint, Some(connection)))
            }
            LaunchTarget::Hpc => self.start_hpc(config, services, cancel).await,
            LaunchTarget::RemoteInstanceManager => self.start_managed(config, services).await,
        }
    }

    async fn start_local_grpc(
        &mut self,
        config: &LaunchConfig,
        services: &LaunchServices,
    ) -> Result<(Endpoint, Option<ConnectionManager>)> {
        let mut checker = license_checker(config, services).await?;

        let process = match launcher::launch_local(config, services.ready_checks).await {
            Ok(process) => process,
            Err(e) => return Err(prefer_license_error(checker.as_mut(), e).await),
        };
        if let Some(checker) = checker.as_mut() {
            checker.abort();
        }

        let run_location = process.run_location().to_path_buf();
        *self = Backend::Local {
            process,
            cleanup_pids: Vec::new(),
        };

        let endpoint = Endpoint {
            ip: config.ip.clone(),
            port: config.port,
        };
        if config.just_launch {
            return Ok((endpoint, None));
        }

        let connection = connect(config, services, &endpoint).await?;
        if let Backend::Local { cleanup_pids, .. } = self {
            *cleanup_pids = workdir::cleanup_script_pids(&run_location, TargetPlatform::current().is_windows());
            if !cleanup_pids.is_empty() {
                debug!("Cached solver PIDs {:?} from the cleanup script", cleanup_pids);
            }
        }
        Ok((endpoint, Some(connection)))
    }

    async fn start_local_console(
        &mut self,
        config: &LaunchConfig,
        services: &LaunchServices,
    ) -> Result<(Endpoint, Option<ConnectionManager>)> {
        let mut checker = license_checker(config, services).await?;

        let mut process = match launcher::launch_local(config, services.ready_checks).await {
            Ok(process) => process,
            Err(e) => return Err(prefer_license_error(checker.as_mut(), e).await),
        };
        let io = process.take_console_io();
        let label = format!("console (PID {})", process.pid());
        *self = Backend::Local {
            process,
            cleanup_pids: Vec::new(),
        };
        let Backend::Local { process, .. } = self else {
            return Err(MapdlError::Internal("console backend was replaced".into()));
        };

        let (stdout, stdin) =
            io.ok_or_else(|| MapdlError::Internal("console process has no piped stdio".into()))?;
        let console = ConsoleTransport::new(stdout, stdin, label);

        if let Err(e) = console.wait_for_begin(config.start_timeout).await {
            let err = if process.is_alive() {
                process.did_not_start(format!("no console prompt: {}", e))
            } else {
                process.did_not_start("MAPDL process died.")
            };
            return Err(prefer_license_error(checker.as_mut(), err).await);
        }
        if let Some(checker) = checker.as_mut() {
            checker.abort();
        }
        info!("MAPDL console (PID {}) is ready", process.pid());

        let endpoint = Endpoint {
            ip: config.ip.clone(),
            port: config.port,
        };
        let options = connect_options(config, services)
            .with_heartbeat_interval(None)
            .with_health_check(false);
        let connection = ConnectionManager::attach(Arc::new(console), options).await?;
        Ok((endpoint, Some(connection)))
    }

    async fn start_hpc(
        &mut self,
        config: &LaunchConfig,
        services: &LaunchServices,
        cancel: &CancellationToken,
    ) -> Result<(Endpoint, Option<ConnectionManager>)> {
        let spec = CommandSpec::from_config(config)
            .ok_or_else(|| MapdlError::config("an HPC launch needs an executable"))?;
        let argv = spec.build(TargetPlatform::Posix);
        let runner = match &services.hpc_runner {
            Some(runner) => runner.clone(),
            None => hpc::runner_for(config.hpc_login.as_ref())?,
        };

        let (job, ip) = hpc::submit_and_wait(
            runner,
            &argv,
            config.scheduler_options.as_ref(),
            config.start_timeout,
            true,
            cancel,
        )
        .await?;
        info!("HPC job {} is running on {}", job.job_id(), ip);
        *self = Backend::Hpc { job };

        let endpoint = Endpoint { ip, port: config.port };
        if config.just_launch {
            return Ok((endpoint, None));
        }
        let connection = connect(config, services, &endpoint).await?;
        Ok((endpoint, Some(connection)))
    }

    async fn start_managed(
        &mut self,
        config: &LaunchConfig,
        services: &LaunchServices,
    ) -> Result<(Endpoint, Option<ConnectionManager>)> {
        if let Some(path) = &config.instance_manager_config {
            let manager_config = InstanceManagerConfig::load(path)?;
            debug!("Instance manager at {}", manager_config.uri);
        }
        let manager = services.instance_manager.clone().ok_or_else(|| MapdlError::InstanceManager {
            message: "no instance manager client is available".into(),
        })?;

        let instance = remote::launch_remote(manager.as_ref(), config.version, config.start_timeout).await?;
        let (ip, port) = instance.endpoint()?;
        *self = Backend::Managed { manager, instance };

        let endpoint = Endpoint { ip, port };
        if config.just_launch {
            return Ok((endpoint, None));
        }
        let connection = connect(config, services, &endpoint).await?;
        Ok((endpoint, Some(connection)))
    }

    /// Kill every process this backend started on this machine.
    pub async fn kill_processes(&mut self) -> Result<()> {
        let Backend::Local { process, cleanup_pids } = self else {
            return Ok(());
        };
        let mut outcome = process.kill().await;
        for &pid in cleanup_pids.iter() {
            if pid == process.pid() {
                continue;
            }
            match platform::kill_process(pid) {
                Ok(true) => debug!("Killed solver process {}", pid),
                Ok(false) => warn!("Solver process {} survived SIGKILL", pid),
                Err(e) => {
                    warn!("Failed to kill solver process {}: {}", pid, e);
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        }
        outcome
    }

    /// Backend-specific teardown after the connection has gone.
    pub async fn teardown(&mut self, config: &LaunchConfig, errors: &mut TeardownErrors) {
        errors.record(TeardownStep::KillProcesses, self.kill_processes().await);

        if let (Backend::Local { .. }, Some(dir)) = (&*self, config.run_location.as_deref()) {
            errors.record(
                TeardownStep::RemoveLockFiles,
                workdir::remove_lock_files(dir, &config.jobname),
            );
        }

        match self {
            Backend::Managed { manager, instance } => {
                info!("Deleting instance '{}'", instance.name);
                errors.record(
                    TeardownStep::DeleteRemoteInstance,
                    manager.delete_instance(instance).await,
                );
            }
            Backend::Hpc { job } => {
                if config.finish_job_on_exit {
                    errors.record(TeardownStep::CancelHpcJob, job.cancel().await);
                } else {
                    info!("Leaving HPC job {} running", job.job_id());
                }
            }
            _ => {}
        }
    }

    /// PIDs to kill synchronously when a session is dropped without exiting.
    pub fn local_pids(&self) -> Vec<u32> {
        match self {
            Backend::Local { process, cleanup_pids } => {
                let mut pids = vec![process.pid()];
                pids.extend(cleanup_pids.iter().copied().filter(|p| *p != process.pid()));
                pids
            }
            _ => Vec::new(),
        }
    }
}

fn connect_options(config: &LaunchConfig, services: &LaunchServices) -> ConnectOptions {
    services.connect.clone().with_set_no_abort(config.set_no_abort)
}

async fn connect(
    config: &LaunchConfig,
    services: &LaunchServices,
    endpoint: &Endpoint,
) -> Result<ConnectionManager> {
    let connector = services.connector_for(config);
    ConnectionManager::connect(connector, &endpoint.ip, endpoint.port, connect_options(config, services)).await
}

/// Start watching the license log when requested and the version is known.
async fn license_checker(config: &LaunchConfig, services: &LaunchServices) -> Result<Option<LicenseChecker>> {
    if !config.license_server_check {
        return Ok(None);
    }
    licensing::check_license_servers(&services.env, LicenseConfig::SERVER_CONNECT_TIMEOUT).await?;

    let Some(version) = config.version else {
        debug!("Solver version unknown; not watching the license log");
        return Ok(None);
    };
    let mut checker = match LicenseChecker::for_version(version) {
        Ok(checker) => checker,
        Err(e) => {
            warn!("License log check unavailable: {}", e);
            return Ok(None);
        }
    };
    checker.start();
    Ok(Some(checker))
}

/// A finished license check that failed explains a failed launch better
/// than the launch error itself.
async fn prefer_license_error(checker: Option<&mut LicenseChecker>, launch_error: MapdlError) -> MapdlError {
    let Some(checker) = checker else {
        return launch_error;
    };
    match checker.finished().await {
        Some(Err(license_error)) => {
            warn!("Launch failed after a license error: {}", launch_error);
            license_error
        }
        _ => {
            checker.abort();
            launch_error
        }
    }
}

/// True when `PYMAPDL_START_INSTANCE=false` asks to leave remote solvers running.
pub(crate) fn keeps_remote_running(services: &LaunchServices) -> bool {
    matches!(services.env.get_bool(EnvVars::START_INSTANCE), Ok(Some(false)))
}
