//! `sbatch` command rendering and SLURM output parsing.

use super::SchedulerOptions;
use crate::config::HpcConfig;
use crate::error::{MapdlError, Result};

/// Wrap a solver command line in an `sbatch` submission.
///
/// ```
/// use mapdl_core::hpc::{generate_sbatch_command, SchedulerOptions};
///
/// let argv = vec!["ansys".to_string(), "-grpc".to_string()];
/// let options = SchedulerOptions::Raw("-N 2".into());
/// assert_eq!(
///     generate_sbatch_command(&argv, Some(&options)).unwrap(),
///     "sbatch -N 2 --wrap 'ansys -grpc'"
/// );
/// ```
pub fn generate_sbatch_command(argv: &[String], options: Option<&SchedulerOptions>) -> Result<String> {
    let rendered = match options {
        Some(options) => {
            options.validate()?;
            options.render()
        }
        None => String::new(),
    };

    let wrapped = format!(
        "'{}'",
        argv.iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let parts = ["sbatch", rendered.as_str(), "--wrap", wrapped.as_str()];
    Ok(parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" "))
}

/// Job id from `sbatch` output (`Submitted batch job 1234`).
pub fn parse_job_id(stdout: &str, stderr: &str) -> Result<u64> {
    if !stdout.contains(HpcConfig::SUBMITTED_MARKER) {
        return Err(MapdlError::Scheduler {
            command: "sbatch".into(),
            message: format!(
                "job submission was not confirmed.\nstdout:\n{}\nstderr:\n{}",
                stdout.trim(),
                stderr.trim()
            ),
        });
    }
    stdout
        .split_whitespace()
        .last()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| MapdlError::Scheduler {
            command: "sbatch".into(),
            message: format!("could not read the job id from '{}'", stdout.trim()),
        })
}

fn field<'a>(scontrol: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{}=", key);
    let start = scontrol.find(&needle)? + needle.len();
    scontrol[start..]
        .split(char::is_whitespace)
        .next()
        .filter(|value| !value.is_empty())
}

/// `JobState` from `scontrol show jobid -dd` output.
pub fn parse_job_state(scontrol: &str) -> Option<String> {
    field(scontrol, "JobState").map(str::to_string)
}

/// `BatchHost` from `scontrol show jobid -dd` output.
pub fn parse_batch_host(scontrol: &str) -> Option<String> {
    field(scontrol, "BatchHost").map(str::to_string)
}
