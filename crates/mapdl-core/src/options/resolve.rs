//! Single-pass resolution of [`LaunchOptions`] into a [`LaunchConfig`].

use super::env::EnvSnapshot;
use super::install::InstallationScanner;
use super::settings::SettingsStore;
use super::slurm::SlurmAllocation;
use super::version::SolverVersion;
use super::{ChildEnv, LaunchConfig, LaunchMode, LaunchOptions, LaunchTarget};
use crate::config::{EnvVars, HpcConfig, LaunchDefaults, NetworkConfig};
use crate::error::{MapdlError, Result};
use crate::licensing;
use crate::platform::{self, TargetPlatform};
use crate::ports::PortRegistry;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

static INTEL_MPI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(-mpi)( *?)(intelmpi)").expect("intel mpi regex must compile")
});

/// Resolve options against the host: installed releases under the default
/// locations and the current platform.
pub fn resolve(
    opts: &LaunchOptions,
    env: &EnvSnapshot,
    settings: &SettingsStore,
    registry: &PortRegistry,
) -> Result<LaunchConfig> {
    resolve_with(
        opts,
        env,
        settings,
        registry,
        &InstallationScanner::system(),
        TargetPlatform::current(),
    )
}

/// Resolve options with an explicit installation scanner and platform.
pub fn resolve_with(
    opts: &LaunchOptions,
    env: &EnvSnapshot,
    settings: &SettingsStore,
    registry: &PortRegistry,
    scanner: &InstallationScanner,
    platform: TargetPlatform,
) -> Result<LaunchConfig> {
    resolve_in(
        opts,
        env,
        settings,
        registry,
        scanner,
        platform,
        &std::env::temp_dir(),
    )
}

/// Temporary run locations are created under `temp_root`.
fn resolve_in(
    opts: &LaunchOptions,
    env: &EnvSnapshot,
    settings: &SettingsStore,
    registry: &PortRegistry,
    scanner: &InstallationScanner,
    platform: TargetPlatform,
    temp_root: &Path,
) -> Result<LaunchConfig> {
    let explicit_ip = opts.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty());

    // start_instance: argument > env > inferred from ip
    let start_instance = match opts.start_instance {
        Some(start) => start,
        None => match env.get_bool(EnvVars::START_INSTANCE)? {
            Some(start) => start,
            None => explicit_ip.is_none() && !env.is_set(EnvVars::IP),
        },
    };

    pre_check(opts, start_instance, explicit_ip)?;

    let slurm = SlurmAllocation::detect(env, opts.running_on_hpc)?;

    // Version and executable
    let mut version = match &opts.version {
        Some(v) => SolverVersion::parse(v)?,
        None => match env.get(EnvVars::VERSION) {
            Some(v) => SolverVersion::parse(v)?,
            None => None,
        },
    };

    let instance_manager_config = env.get(EnvVars::INSTANCE_MANAGER_CONFIG).map(PathBuf::from);
    let use_instance_manager = start_instance
        && instance_manager_config.is_some()
        && opts.exec_file.is_none()
        && explicit_ip.is_none()
        && !opts.launch_on_hpc;

    let exec_file = if !start_instance || use_instance_manager {
        None
    } else {
        Some(resolve_exec_file(opts, env, settings, scanner, version)?)
    };

    if version.is_none() {
        if let Some(exec) = &exec_file {
            version = SolverVersion::from_exec_path(exec);
            if let Some(v) = version {
                if v.as_u32() < 202 && opts.mode != Some(LaunchMode::Console) {
                    return Err(MapdlError::UnsupportedVersion {
                        version: v.to_string(),
                        message: "the MAPDL gRPC interface requires MAPDL 20.2 or later"
                            .to_string(),
                    });
                }
            }
        }
    }

    let mode = check_mode(opts.mode, version, platform)?;
    if opts.launch_on_hpc && mode != LaunchMode::Grpc {
        return Err(MapdlError::InvalidMode {
            mode: mode.to_string(),
            message: "the only mode allowed to launch MAPDL on an HPC cluster is gRPC"
                .to_string(),
        });
    }

    let target = if use_instance_manager {
        LaunchTarget::RemoteInstanceManager
    } else if opts.launch_on_hpc {
        LaunchTarget::Hpc
    } else if start_instance {
        match mode {
            LaunchMode::Grpc => LaunchTarget::LocalGrpc,
            LaunchMode::Console => LaunchTarget::LocalConsole,
        }
    } else {
        LaunchTarget::RemoteEndpoint
    };
    debug!("Resolved launch target {:?} in {} mode", target, mode);

    let jobname = opts
        .jobname
        .clone()
        .or_else(|| slurm.as_ref().map(|s| s.job_name.clone()))
        .unwrap_or_else(|| LaunchDefaults::JOBNAME.to_string());

    let nproc = resolve_nproc(opts, env, slurm.as_ref())?;
    if target.is_local() && slurm.is_none() {
        let available = physical_cores();
        if available < nproc {
            return Err(MapdlError::NotEnoughResources {
                requested: nproc,
                available,
            });
        }
    }

    let ram = match opts.ram {
        Some(ram) => Some(ram),
        None => match &slurm {
            Some(alloc) => alloc.ram_gb()?,
            None => None,
        },
    };

    let start_timeout = start_timeout(opts.start_timeout, opts.launch_on_hpc, slurm.is_some());

    let additional_switches = build_switches(
        opts,
        version,
        exec_file.as_deref(),
        slurm.is_some(),
        platform,
    );

    let env_vars = build_child_env(opts, slurm.is_some(), target);

    let ip = resolve_ip(explicit_ip, env)?;

    // The temporary directory is removed on drop until the config is built
    let (run_location, temp_guard) = match target {
        LaunchTarget::LocalGrpc | LaunchTarget::LocalConsole | LaunchTarget::Hpc => {
            let (dir, guard) = resolve_run_location(opts.run_location.as_deref(), temp_root)?;
            (Some(dir), guard)
        }
        LaunchTarget::RemoteEndpoint | LaunchTarget::RemoteInstanceManager => (None, None),
    };
    let run_location_is_temp = temp_guard.is_some();

    let max_message_length = match opts.max_message_length {
        Some(len) => len,
        None => env
            .get_usize(EnvVars::MAX_MESSAGE_LENGTH)?
            .unwrap_or(NetworkConfig::MAX_MESSAGE_LENGTH),
    };

    // Port last, so a failed resolution never leaves a claim behind
    let requested_port = match opts.port {
        Some(port) => Some(port),
        None => env
            .get_u32(EnvVars::PORT)?
            .map(PortRegistry::validate)
            .transpose()?,
    };
    let (port, port_claimed) = match target {
        LaunchTarget::LocalGrpc => (registry.allocate(requested_port, true)?, true),
        LaunchTarget::Hpc => (registry.allocate(requested_port, false)?, true),
        LaunchTarget::LocalConsole
        | LaunchTarget::RemoteEndpoint
        | LaunchTarget::RemoteInstanceManager => {
            let port = requested_port.unwrap_or(LaunchDefaults::PORT);
            PortRegistry::validate(u32::from(port))?;
            (port, false)
        }
    };

    info!(
        "Launch configuration: target={:?} ip={} port={} jobname={} nproc={}",
        target, ip, port, jobname, nproc
    );

    let config = LaunchConfig {
        target,
        mode,
        start_instance,
        exec_file,
        version,
        ip,
        port,
        port_claimed,
        jobname,
        nproc,
        ram,
        additional_switches,
        run_location,
        run_location_is_temp,
        remove_temp_dir_on_exit: opts.remove_temp_dir_on_exit && run_location_is_temp,
        override_lock: opts.override_lock,
        start_timeout,
        cleanup_on_exit: opts.cleanup_on_exit,
        set_no_abort: opts.set_no_abort,
        license_server_check: opts.license_server_check && slurm.is_none(),
        env: env_vars,
        slurm,
        finish_job_on_exit: opts.finish_job_on_exit,
        scheduler_options: opts.scheduler_options.clone(),
        hpc_login: opts.hpc_login.clone(),
        just_launch: opts.just_launch,
        mapdl_output: opts.mapdl_output.clone(),
        max_message_length,
        instance_manager_config: if use_instance_manager {
            instance_manager_config
        } else {
            None
        },
    };
    if let Some(guard) = temp_guard {
        let _ = guard.keep();
    }
    Ok(config)
}

fn pre_check(opts: &LaunchOptions, start_instance: bool, ip: Option<&str>) -> Result<()> {
    if start_instance && ip.is_some() && !opts.on_pool {
        return Err(MapdlError::conflict(
            "'start_instance' and 'ip' are incompatible: an explicit IP connects to an \
             already running instance",
        ));
    }
    if opts.exec_file.is_some() && opts.version.is_some() {
        return Err(MapdlError::conflict(
            "'exec_file' and 'version' cannot be used together",
        ));
    }
    if opts.launch_on_hpc && ip.is_some() {
        return Err(MapdlError::conflict(
            "the IP of an HPC job cannot be chosen; connect to a running job with \
             'start_instance=false' and its 'ip' instead",
        ));
    }
    if opts.launch_on_hpc && opts.start_instance == Some(false) {
        return Err(MapdlError::conflict(
            "'start_instance' must be true when launching on HPC",
        ));
    }
    if opts.scheduler_options.is_some() && opts.nproc.is_none() {
        return Err(MapdlError::conflict(
            "'scheduler_options' requires an explicit 'nproc'",
        ));
    }
    if let Some(scheduler_options) = &opts.scheduler_options {
        scheduler_options.validate()?;
    }
    if opts.add_env_vars.is_some() && opts.replace_env_vars.is_some() {
        return Err(MapdlError::conflict(
            "'add_env_vars' and 'replace_env_vars' are mutually exclusive",
        ));
    }
    if let Some(ram) = opts.ram {
        if ram.is_nan() || ram <= 0.0 {
            return Err(MapdlError::config(format!(
                "'ram' must be a positive number of gigabytes, got {}",
                ram
            )));
        }
    }
    if opts.nproc == Some(0) {
        return Err(MapdlError::config("'nproc' must be at least 1"));
    }
    Ok(())
}

fn resolve_exec_file(
    opts: &LaunchOptions,
    env: &EnvSnapshot,
    settings: &SettingsStore,
    scanner: &InstallationScanner,
    version: Option<SolverVersion>,
) -> Result<PathBuf> {
    let exec = opts
        .exec_file
        .clone()
        .or_else(|| env.get(EnvVars::EXEC_FILE).map(PathBuf::from))
        .or_else(|| {
            if version.is_some() {
                None
            } else {
                settings.exec_file().map(Path::to_path_buf)
            }
        })
        .or_else(|| scanner.find(version));

    match exec {
        // The executable lives on the cluster, not on this host
        Some(path) if opts.launch_on_hpc => Ok(path),
        Some(path) if path.is_file() => {
            debug!("Using MAPDL executable {}", path.display());
            Ok(path)
        }
        Some(path) => Err(MapdlError::ExecutableNotFound(path)),
        None if opts.launch_on_hpc => Ok(PathBuf::from("ansys")),
        None => Err(MapdlError::ExecutableNotFound(PathBuf::from(match version {
            Some(v) => format!("ansys{}", v.as_u32()),
            None => "ansys".to_string(),
        }))),
    }
}

/// Choose the interface for a release.
pub fn check_mode(
    mode: Option<LaunchMode>,
    version: Option<SolverVersion>,
    platform: TargetPlatform,
) -> Result<LaunchMode> {
    let console_on_windows = || MapdlError::InvalidMode {
        mode: LaunchMode::Console.to_string(),
        message: "console mode is only supported on Linux and macOS".to_string(),
    };

    let Some(version) = version else {
        return match mode {
            None => Ok(LaunchMode::Grpc),
            Some(LaunchMode::Console) if platform.is_windows() => Err(console_on_windows()),
            Some(mode) => {
                warn!("MAPDL version unknown; assuming '{}' mode is supported", mode);
                Ok(mode)
            }
        };
    };

    let v = version.as_u32();
    match mode {
        Some(LaunchMode::Grpc) => {
            let too_old = if platform.is_windows() { v < 202 } else { v < 211 };
            if too_old {
                return Err(MapdlError::UnsupportedVersion {
                    version: version.to_string(),
                    message: "the gRPC interface requires MAPDL 21.1 or later (20.2 on Windows)"
                        .to_string(),
                });
            }
            Ok(LaunchMode::Grpc)
        }
        Some(LaunchMode::Console) => {
            if platform.is_windows() {
                return Err(console_on_windows());
            }
            if v >= 211 {
                warn!("Console mode is not recommended for MAPDL 21.1 or later; prefer gRPC");
            }
            Ok(LaunchMode::Console)
        }
        None => {
            if v >= 211 || (v == 202 && platform.is_windows()) {
                Ok(LaunchMode::Grpc)
            } else if platform.is_windows() {
                Err(MapdlError::UnsupportedVersion {
                    version: version.to_string(),
                    message: "MAPDL releases before 20.2 are not supported on Windows".to_string(),
                })
            } else {
                Ok(LaunchMode::Console)
            }
        }
    }
}

fn resolve_nproc(
    opts: &LaunchOptions,
    env: &EnvSnapshot,
    slurm: Option<&SlurmAllocation>,
) -> Result<u32> {
    if let Some(nproc) = opts.nproc {
        return Ok(nproc);
    }
    if let Some(nproc) = env.get_u32(EnvVars::NPROC)? {
        return Ok(nproc);
    }
    if let Some(alloc) = slurm {
        return Ok(alloc.nproc());
    }
    let cores = physical_cores();
    Ok(if cores < LaunchDefaults::MIN_NPROC {
        cores.max(1)
    } else {
        LaunchDefaults::MIN_NPROC
    })
}

fn physical_cores() -> u32 {
    sysinfo::System::new()
        .physical_core_count()
        .map(|c| c as u32)
        .unwrap_or(1)
}

fn build_switches(
    opts: &LaunchOptions,
    version: Option<SolverVersion>,
    exec_file: Option<&Path>,
    in_slurm: bool,
    platform: TargetPlatform,
) -> String {
    let mut switches = opts.additional_switches.trim().to_string();

    switches = licensing::license_switch(opts.license_type.as_deref(), &switches);

    // Microsoft MPI is required on Windows for 21.0 up to 22.1
    if platform.is_windows() && !switches.to_lowercase().contains("smp") && !opts.force_intel {
        if let Some(v) = version.map(SolverVersion::as_u32) {
            if (210..222).contains(&v) {
                switches = INTEL_MPI_RE.replace_all(&switches, "").to_string();
                switches.push_str(" -mpi msmpi");
                debug!("Forcing Microsoft MPI for MAPDL {}", v);
            }
        }
    }

    let lower = switches.to_lowercase();
    let student = exec_file
        .map(|p| p.to_string_lossy().to_lowercase().contains("student"))
        .unwrap_or(false);
    if student && !lower.contains("-mpi") && !lower.contains("-dmp") && !lower.contains("-smp") {
        switches.push_str(" -smp");
        debug!("Student executable detected; using shared memory parallel");
    }

    if (in_slurm || opts.launch_on_hpc) && !switches.contains("-dis ") && !switches.ends_with("-dis")
    {
        switches.push_str(" -dis");
    }

    switches.trim().to_string()
}

fn build_child_env(opts: &LaunchOptions, in_slurm: bool, target: LaunchTarget) -> ChildEnv {
    // Both set is rejected by pre_check
    let mut env = match (&opts.add_env_vars, &opts.replace_env_vars) {
        (_, Some(replace)) => ChildEnv::Replace(replace.clone()),
        (Some(add), None) => ChildEnv::Inherit(add.clone()),
        (None, None) => ChildEnv::Inherit(BTreeMap::new()),
    };

    if target.is_local() && platform::is_ubuntu() {
        env.set("I_MPI_SHM_LMT", "shm");
    }

    if in_slurm || opts.launch_on_hpc {
        env.set("ANS_MULTIPLE_NODES", "1");
        env.set("HYDRA_BOOTSTRAP", "slurm");
    }

    env
}

fn resolve_ip(explicit: Option<&str>, env: &EnvSnapshot) -> Result<String> {
    let ip = match explicit.or_else(|| env.get(EnvVars::IP)) {
        Some(ip) => ip.to_string(),
        None if platform::is_wsl() => platform::wsl_host_ip().ok_or_else(|| {
            MapdlError::config("running under WSL but the Windows host IP could not be found")
        })?,
        None => LaunchDefaults::IP.to_string(),
    };
    to_ip_address(&ip)
}

/// Resolve a hostname to an IP address; IP literals pass through.
pub(crate) fn to_ip_address(host: &str) -> Result<String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|e| MapdlError::config(format!("could not resolve host '{}': {}", host, e)))?
        .collect::<Vec<_>>();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip().to_string())
        .ok_or_else(|| MapdlError::config(format!("host '{}' has no address", host)))
}

fn resolve_run_location(
    requested: Option<&Path>,
    temp_root: &Path,
) -> Result<(PathBuf, Option<tempfile::TempDir>)> {
    match requested {
        Some(dir) => {
            if !dir.is_dir() {
                std::fs::create_dir_all(dir).map_err(|e| MapdlError::io_with_path(e, dir))?;
                info!("Created run location {}", dir.display());
            }
            check_writable(dir)?;
            Ok((dir.to_path_buf(), None))
        }
        None => {
            let temp = tempfile::Builder::new()
                .prefix(LaunchDefaults::TEMP_DIR_PREFIX)
                .tempdir_in(temp_root)
                .map_err(|e| MapdlError::io_with_path(e, temp_root))?;
            debug!("Created temporary run location {}", temp.path().display());
            Ok((temp.path().to_path_buf(), Some(temp)))
        }
    }
}

fn check_writable(dir: &Path) -> Result<()> {
    tempfile::NamedTempFile::new_in(dir)
        .map(drop)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => MapdlError::PermissionDenied(dir.to_path_buf()),
            _ => MapdlError::io_with_path(e, dir),
        })
}

/// Requested timeout or the default, doubled inside a SLURM allocation.
fn start_timeout(requested: Option<Duration>, launch_on_hpc: bool, in_slurm: bool) -> Duration {
    let base = requested.unwrap_or(if launch_on_hpc {
        LaunchDefaults::HPC_START_TIMEOUT
    } else {
        LaunchDefaults::START_TIMEOUT
    });
    if in_slurm {
        base * HpcConfig::START_TIMEOUT_MULTIPLIER
    } else {
        base
    }
}
