//! Launching MAPDL through a SLURM scheduler.
//!
//! The solver command line is wrapped in `sbatch --wrap`, submitted through a
//! [`CommandRunner`] (local shell or SSH login node), and the job is polled
//! with `scontrol` until it runs. The batch host then becomes the solver IP.
//!
//! - `sbatch` - command rendering and scheduler output parsing
//! - `runner` - where scheduler commands execute
//! - `job` - submission, polling and cancellation

mod job;
mod runner;
mod sbatch;
#[cfg(feature = "ssh")]
mod ssh;

pub use job::{submit_and_wait, HpcJob};
pub use runner::{CommandOutput, CommandRunner, LocalRunner};
pub use sbatch::{generate_sbatch_command, parse_batch_host, parse_job_id, parse_job_state};
#[cfg(feature = "ssh")]
pub use ssh::SshRunner;

use crate::config::HpcConfig;
use crate::error::{MapdlError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Extra `sbatch` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchedulerOptions {
    /// Passed through verbatim, e.g. `"-N 2 --partition=short"`.
    Raw(String),
    /// Key/value pairs. Keys may omit their dashes; empty values render as flags.
    Map(Vec<(String, String)>),
}

impl SchedulerOptions {
    /// Reject options that would clash with the generated `--wrap`.
    pub fn validate(&self) -> Result<()> {
        let has_wrap = match self {
            SchedulerOptions::Raw(raw) => raw.contains("wrap"),
            SchedulerOptions::Map(entries) => entries
                .iter()
                .any(|(key, _)| key.trim_start_matches('-') == "wrap"),
        };
        if has_wrap {
            return Err(MapdlError::config(
                "The sbatch argument 'wrap' is generated by the launcher and cannot be given in scheduler options",
            ));
        }
        Ok(())
    }

    /// Render as a single argument string.
    pub fn render(&self) -> String {
        match self {
            SchedulerOptions::Raw(raw) => raw.trim().to_string(),
            SchedulerOptions::Map(entries) => entries
                .iter()
                .map(|(key, value)| render_option(key, value))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

fn render_option(key: &str, value: &str) -> String {
    let flag = add_dashes(key);
    if flag.is_empty() {
        return String::new();
    }
    if value.is_empty() {
        flag
    } else if flag.starts_with("--") {
        format!("{}='{}'", flag, value)
    } else {
        format!("{} '{}'", flag, value)
    }
}

/// `n` becomes `-n`, `nodes` becomes `--nodes`, `-nodes` becomes `--nodes`.
fn add_dashes(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        return String::new();
    }
    if !key.starts_with('-') {
        if key.chars().count() == 1 {
            format!("-{}", key)
        } else {
            format!("--{}", key)
        }
    } else if !key.starts_with("--") && key.len() > 2 {
        format!("-{}", key)
    } else {
        key.to_string()
    }
}

/// SSH login node used to reach the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    /// Known-hosts file; the user's default when absent.
    #[serde(default)]
    pub known_hosts: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    HpcConfig::DEFAULT_SSH_PORT
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            port: HpcConfig::DEFAULT_SSH_PORT,
            user: user.into(),
            key_path: key_path.into(),
            known_hosts: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }
}

/// Runner for scheduler commands: SSH when a login node is configured.
pub fn runner_for(login: Option<&SshTarget>) -> Result<Arc<dyn CommandRunner>> {
    match login {
        None => Ok(Arc::new(LocalRunner)),
        #[cfg(feature = "ssh")]
        Some(target) => Ok(Arc::new(SshRunner::new(target.clone()))),
        #[cfg(not(feature = "ssh"))]
        Some(target) => Err(MapdlError::config(format!(
            "Submitting through the login node '{}' requires the 'ssh' feature",
            target.host
        ))),
    }
}
