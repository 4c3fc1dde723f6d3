//! Launch options and their resolution.
//!
//! [`LaunchOptions`] holds what the caller asked for. [`resolve`] applies the
//! precedence rule (argument > environment > cached config > default) once
//! and produces an immutable [`LaunchConfig`] that selects exactly one
//! [`LaunchTarget`].

mod env;
mod install;
mod resolve;
mod settings;
mod slurm;
mod version;

pub use env::EnvSnapshot;
pub use install::{Installation, InstallationScanner};
pub use resolve::{check_mode, resolve, resolve_with};
pub(crate) use resolve::to_ip_address;
pub use settings::SettingsStore;
pub use slurm::SlurmAllocation;
pub use version::{SolverVersion, SUPPORTED_VERSIONS};

use crate::error::MapdlError;
use crate::hpc::{SchedulerOptions, SshTarget};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How the client talks to the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchMode {
    Grpc,
    Console,
}

impl FromStr for LaunchMode {
    type Err = MapdlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grpc" => Ok(LaunchMode::Grpc),
            "console" => Ok(LaunchMode::Console),
            other => Err(MapdlError::InvalidMode {
                mode: other.to_string(),
                message: "mode must be 'grpc' or 'console'".to_string(),
            }),
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Grpc => f.write_str("grpc"),
            LaunchMode::Console => f.write_str("console"),
        }
    }
}

/// Where the solver runs and how the session reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchTarget {
    /// Spawn a local process serving gRPC.
    LocalGrpc,
    /// Spawn a local process driven through stdin/stdout.
    LocalConsole,
    /// Ask a remote instance manager for a new instance.
    RemoteInstanceManager,
    /// Connect to an instance that is already running.
    RemoteEndpoint,
    /// Submit the solver as a SLURM batch job.
    Hpc,
}

impl LaunchTarget {
    /// True when this process spawns the solver itself.
    pub fn is_local(self) -> bool {
        matches!(self, LaunchTarget::LocalGrpc | LaunchTarget::LocalConsole)
    }
}

/// Environment handed to the solver process.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildEnv {
    /// The launcher's environment plus these overrides.
    Inherit(BTreeMap<String, String>),
    /// Exactly these variables.
    Replace(BTreeMap<String, String>),
}

impl Default for ChildEnv {
    fn default() -> Self {
        ChildEnv::Inherit(BTreeMap::new())
    }
}

impl ChildEnv {
    /// Set a variable in either form.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        match self {
            ChildEnv::Inherit(vars) | ChildEnv::Replace(vars) => {
                vars.insert(key.into(), value.into());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            ChildEnv::Inherit(vars) | ChildEnv::Replace(vars) => vars.get(key).map(String::as_str),
        }
    }

    /// Apply to a command before spawning.
    pub fn apply(&self, command: &mut tokio::process::Command) {
        match self {
            ChildEnv::Inherit(vars) => {
                command.envs(vars);
            }
            ChildEnv::Replace(vars) => {
                command.env_clear().envs(vars);
            }
        }
    }
}

/// Options supplied by the caller. Unset fields fall back to the
/// environment, the cached settings, then defaults.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub exec_file: Option<PathBuf>,
    pub run_location: Option<PathBuf>,
    pub jobname: Option<String>,
    pub nproc: Option<u32>,
    /// Memory in gigabytes.
    pub ram: Option<f64>,
    pub mode: Option<LaunchMode>,
    pub override_lock: bool,
    pub remove_temp_dir_on_exit: bool,
    pub start_timeout: Option<Duration>,
    pub port: Option<u16>,
    pub ip: Option<String>,
    pub cleanup_on_exit: bool,
    pub start_instance: Option<bool>,
    pub additional_switches: String,
    pub license_type: Option<String>,
    pub license_server_check: bool,
    pub force_intel: bool,
    pub version: Option<String>,
    pub running_on_hpc: bool,
    pub launch_on_hpc: bool,
    pub finish_job_on_exit: bool,
    pub scheduler_options: Option<SchedulerOptions>,
    pub hpc_login: Option<SshTarget>,
    pub add_env_vars: Option<BTreeMap<String, String>>,
    pub replace_env_vars: Option<BTreeMap<String, String>>,
    /// Allows an explicit `ip` together with `start_instance`.
    pub on_pool: bool,
    pub set_no_abort: bool,
    /// Launch only; do not connect.
    pub just_launch: bool,
    /// Redirect solver output to this file instead of capturing it.
    pub mapdl_output: Option<PathBuf>,
    pub max_message_length: Option<usize>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            exec_file: None,
            run_location: None,
            jobname: None,
            nproc: None,
            ram: None,
            mode: None,
            override_lock: false,
            remove_temp_dir_on_exit: false,
            start_timeout: None,
            port: None,
            ip: None,
            cleanup_on_exit: true,
            start_instance: None,
            additional_switches: String::new(),
            license_type: None,
            license_server_check: false,
            force_intel: false,
            version: None,
            running_on_hpc: true,
            launch_on_hpc: false,
            finish_job_on_exit: true,
            scheduler_options: None,
            hpc_login: None,
            add_env_vars: None,
            replace_env_vars: None,
            on_pool: false,
            set_no_abort: true,
            just_launch: false,
            mapdl_output: None,
            max_message_length: None,
        }
    }
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exec_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_file = Some(path.into());
        self
    }

    pub fn with_run_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_location = Some(path.into());
        self
    }

    pub fn with_jobname(mut self, jobname: impl Into<String>) -> Self {
        self.jobname = Some(jobname.into());
        self
    }

    pub fn with_nproc(mut self, nproc: u32) -> Self {
        self.nproc = Some(nproc);
        self
    }

    /// Memory in gigabytes.
    pub fn with_ram(mut self, ram: f64) -> Self {
        self.ram = Some(ram);
        self
    }

    pub fn with_mode(mut self, mode: LaunchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_override_lock(mut self, override_lock: bool) -> Self {
        self.override_lock = override_lock;
        self
    }

    pub fn with_remove_temp_dir_on_exit(mut self, remove: bool) -> Self {
        self.remove_temp_dir_on_exit = remove;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_cleanup_on_exit(mut self, cleanup: bool) -> Self {
        self.cleanup_on_exit = cleanup;
        self
    }

    pub fn with_start_instance(mut self, start: bool) -> Self {
        self.start_instance = Some(start);
        self
    }

    pub fn with_additional_switches(mut self, switches: impl Into<String>) -> Self {
        self.additional_switches = switches.into();
        self
    }

    pub fn with_license_type(mut self, license: impl Into<String>) -> Self {
        self.license_type = Some(license.into());
        self
    }

    pub fn with_license_server_check(mut self, check: bool) -> Self {
        self.license_server_check = check;
        self
    }

    pub fn with_force_intel(mut self, force: bool) -> Self {
        self.force_intel = force;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_running_on_hpc(mut self, running: bool) -> Self {
        self.running_on_hpc = running;
        self
    }

    pub fn with_launch_on_hpc(mut self, launch: bool) -> Self {
        self.launch_on_hpc = launch;
        self
    }

    pub fn with_finish_job_on_exit(mut self, finish: bool) -> Self {
        self.finish_job_on_exit = finish;
        self
    }

    pub fn with_scheduler_options(mut self, options: SchedulerOptions) -> Self {
        self.scheduler_options = Some(options);
        self
    }

    pub fn with_hpc_login(mut self, target: SshTarget) -> Self {
        self.hpc_login = Some(target);
        self
    }

    pub fn with_add_env_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.add_env_vars = Some(vars);
        self
    }

    pub fn with_replace_env_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.replace_env_vars = Some(vars);
        self
    }

    pub fn with_on_pool(mut self, on_pool: bool) -> Self {
        self.on_pool = on_pool;
        self
    }

    pub fn with_set_no_abort(mut self, set_no_abort: bool) -> Self {
        self.set_no_abort = set_no_abort;
        self
    }

    pub fn with_just_launch(mut self, just_launch: bool) -> Self {
        self.just_launch = just_launch;
        self
    }

    pub fn with_mapdl_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.mapdl_output = Some(path.into());
        self
    }

    pub fn with_max_message_length(mut self, bytes: usize) -> Self {
        self.max_message_length = Some(bytes);
        self
    }
}

/// Fully resolved launch configuration.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub target: LaunchTarget,
    pub mode: LaunchMode,
    pub start_instance: bool,
    /// Absent when connecting to an existing instance.
    pub exec_file: Option<PathBuf>,
    pub version: Option<SolverVersion>,
    pub ip: String,
    pub port: u16,
    /// Whether `port` is claimed in the registry and must be released.
    pub port_claimed: bool,
    pub jobname: String,
    pub nproc: u32,
    /// Memory in gigabytes.
    pub ram: Option<f64>,
    pub additional_switches: String,
    /// Working directory of the solver. Absent for remote targets.
    pub run_location: Option<PathBuf>,
    /// True when `run_location` was created by the launcher.
    pub run_location_is_temp: bool,
    pub remove_temp_dir_on_exit: bool,
    pub override_lock: bool,
    pub start_timeout: Duration,
    pub cleanup_on_exit: bool,
    pub set_no_abort: bool,
    pub license_server_check: bool,
    pub env: ChildEnv,
    pub slurm: Option<SlurmAllocation>,
    pub finish_job_on_exit: bool,
    pub scheduler_options: Option<SchedulerOptions>,
    pub hpc_login: Option<SshTarget>,
    pub just_launch: bool,
    pub mapdl_output: Option<PathBuf>,
    pub max_message_length: usize,
    /// Instance manager configuration file, for [`LaunchTarget::RemoteInstanceManager`].
    pub instance_manager_config: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn running_on_hpc(&self) -> bool {
        self.slurm.is_some()
    }

    /// `ip:port` of the solver endpoint.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("GRPC".parse::<LaunchMode>().unwrap(), LaunchMode::Grpc);
        assert_eq!(" console ".parse::<LaunchMode>().unwrap(), LaunchMode::Console);
        assert!(matches!(
            "corba".parse::<LaunchMode>(),
            Err(MapdlError::InvalidMode { .. })
        ));
    }

    #[test]
    fn test_child_env_set_and_get() {
        let mut env = ChildEnv::default();
        env.set("A", "1");
        assert_eq!(env.get("A"), Some("1"));

        let mut replace = ChildEnv::Replace(BTreeMap::new());
        replace.set("B", "2");
        assert_eq!(replace.get("B"), Some("2"));
        assert_eq!(replace.get("A"), None);
    }

    #[test]
    fn test_builder_defaults() {
        let opts = LaunchOptions::new().with_port(50060).with_nproc(4);
        assert_eq!(opts.port, Some(50060));
        assert_eq!(opts.nproc, Some(4));
        assert!(opts.cleanup_on_exit);
        assert!(opts.set_no_abort);
        assert!(opts.running_on_hpc);
        assert!(opts.finish_job_on_exit);
    }
}
