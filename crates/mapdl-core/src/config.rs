//! Centralized configuration for the MAPDL launcher.
//!
//! Constants for launching, networking, file transfer, HPC submission and
//! licensing, plus the names of the environment variables the launcher reads.

use std::time::Duration;

/// Defaults used when launching a local MAPDL process.
pub struct LaunchDefaults;

impl LaunchDefaults {
    pub const PORT: u16 = 50052;
    pub const IP: &'static str = "127.0.0.1";
    pub const JOBNAME: &'static str = "file";
    pub const START_TIMEOUT: Duration = Duration::from_secs(45);
    pub const HPC_START_TIMEOUT: Duration = Duration::from_secs(90);
    pub const MIN_NPROC: u32 = 2;
    pub const MAX_COMMAND_LENGTH: usize = 639;
    pub const TEMP_DIR_PREFIX: &'static str = "ansys_";

    // Valid port range is exclusive on both ends
    pub const MIN_PORT: u16 = 1000;
    pub const MAX_PORT: u16 = 60000;

    // Readiness polling
    pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const GRPC_BANNER_START: &'static str = "START GRPC SERVER";
    pub const GRPC_BANNER_LISTENING: &'static str = "Server listening on";

    // Windows batch mode needs a throwaway input/output pair
    pub const WINDOWS_TMP_INPUT: &'static str = ".__tmp__.inp";
    pub const WINDOWS_TMP_OUTPUT: &'static str = ".__tmp__.out";

    // Files that mark an in-use job directory
    pub const GLOBAL_LOCK_FILE: &'static str = "file.lock";
    pub const CLEANUP_SCRIPT_MARKER: &'static str = "cleanup";

    // Process termination
    pub const KILL_TIMEOUT_MS: u64 = 1000;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_ATTEMPTS: u32 = 5;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(10);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const MAX_MESSAGE_LENGTH: usize = 256 * 1024 * 1024;
    pub const STREAM_BUFFER: usize = 64;
    pub const LOOPBACK_HOSTS: [&'static str; 3] = ["127.0.0.1", "127.0.1.1", "localhost"];
}

/// File transfer configuration.
pub struct TransferConfig;

impl TransferConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
    pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
    pub const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
    /// Downloaded chunks buffered between the connection and the file.
    pub const DOWNLOAD_QUEUE_DEPTH: usize = 4;
}

/// HPC (SLURM) configuration.
pub struct HpcConfig;

impl HpcConfig {
    pub const START_TIMEOUT_MULTIPLIER: u32 = 2;
    pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const SUBMITTED_MARKER: &'static str = "Submitted batch job";
    pub const RUNNING_STATE: &'static str = "RUNNING";
    pub const DEFAULT_SSH_PORT: u16 = 22;
    pub const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Licensing configuration.
pub struct LicenseConfig;

impl LicenseConfig {
    pub const DEFAULT_SERVER_PORT: u16 = 1055;
    pub const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
    pub const APP_NAME: &'static str = "FEAT_ANSYS";
    pub const LOG_FILE_WAIT: Duration = Duration::from_secs(10);
    pub const CHECKOUT_PORT: u16 = 2325;
    /// First release whose licdebug file names include the host name.
    pub const HOSTNAME_IN_LOG_SINCE: u32 = 221;
}

/// Names of the environment variables consulted during resolution.
pub struct EnvVars;

impl EnvVars {
    pub const START_INSTANCE: &'static str = "PYMAPDL_START_INSTANCE";
    pub const IP: &'static str = "PYMAPDL_IP";
    pub const PORT: &'static str = "PYMAPDL_PORT";
    pub const EXEC_FILE: &'static str = "PYMAPDL_MAPDL_EXEC";
    pub const VERSION: &'static str = "PYMAPDL_MAPDL_VERSION";
    pub const NPROC: &'static str = "PYMAPDL_NPROC";
    pub const MAX_MESSAGE_LENGTH: &'static str = "PYMAPDL_MAX_MESSAGE_LENGTH";
    pub const RUNNING_ON_HPC: &'static str = "PYMAPDL_RUNNING_ON_HPC";
    pub const LICENSE_DIR: &'static str = "ANSYSLIC_DIR";
    pub const LICENSE_FILE: &'static str = "ANSYSLMD_LICENSE_FILE";
    pub const INSTANCE_MANAGER_CONFIG: &'static str = "ANSYS_PLATFORM_INSTANCEMANAGEMENT_CONFIG";

    pub const SLURM_JOB_NAME: &'static str = "SLURM_JOB_NAME";
    pub const SLURM_JOB_ID: &'static str = "SLURM_JOB_ID";
    pub const SLURM_NNODES: &'static str = "SLURM_NNODES";
    pub const SLURM_NTASKS: &'static str = "SLURM_NTASKS";
    pub const SLURM_CPUS_PER_TASK: &'static str = "SLURM_CPUS_PER_TASK";
    pub const SLURM_NPROCS: &'static str = "SLURM_NPROCS";
    pub const SLURM_CPUS_ON_NODE: &'static str = "SLURM_CPUS_ON_NODE";
    pub const SLURM_MEM_PER_NODE: &'static str = "SLURM_MEM_PER_NODE";

    /// Every variable captured by [`crate::options::EnvSnapshot::from_process`].
    pub const ALL: [&'static str; 19] = [
        Self::START_INSTANCE,
        Self::IP,
        Self::PORT,
        Self::EXEC_FILE,
        Self::VERSION,
        Self::NPROC,
        Self::MAX_MESSAGE_LENGTH,
        Self::RUNNING_ON_HPC,
        Self::LICENSE_DIR,
        Self::LICENSE_FILE,
        Self::INSTANCE_MANAGER_CONFIG,
        Self::SLURM_JOB_NAME,
        Self::SLURM_JOB_ID,
        Self::SLURM_NNODES,
        Self::SLURM_NTASKS,
        Self::SLURM_CPUS_PER_TASK,
        Self::SLURM_NPROCS,
        Self::SLURM_CPUS_ON_NODE,
        Self::SLURM_MEM_PER_NODE,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_in_valid_range() {
        assert!(LaunchDefaults::PORT > LaunchDefaults::MIN_PORT);
        assert!(LaunchDefaults::PORT < LaunchDefaults::MAX_PORT);
    }

    #[test]
    fn test_chunk_bounds() {
        assert!(TransferConfig::DEFAULT_CHUNK_SIZE <= TransferConfig::MAX_CHUNK_SIZE);
        assert!(TransferConfig::MAX_CHUNK_SIZE < NetworkConfig::MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_env_var_list_has_no_duplicates() {
        let mut names = EnvVars::ALL.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EnvVars::ALL.len());
    }
}
