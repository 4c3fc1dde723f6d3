//! SLURM job submission, polling and cancellation.

use super::runner::CommandRunner;
use super::sbatch::{generate_sbatch_command, parse_batch_host, parse_job_id, parse_job_state};
use super::SchedulerOptions;
use crate::cancel::CancellationToken;
use crate::config::HpcConfig;
use crate::error::{MapdlError, Result};
use crate::options::to_ip_address;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A submitted SLURM job.
#[derive(Clone)]
pub struct HpcJob {
    job_id: u64,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
}

impl std::fmt::Debug for HpcJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpcJob")
            .field("job_id", &self.job_id)
            .field("runner", &self.runner.describe())
            .finish()
    }
}

impl HpcJob {
    /// Submit `argv` through `sbatch --wrap`.
    pub async fn submit(
        runner: Arc<dyn CommandRunner>,
        argv: &[String],
        options: Option<&SchedulerOptions>,
    ) -> Result<Self> {
        let command = generate_sbatch_command(argv, options)?;
        info!("Submitting HPC job via {}: {}", runner.describe(), command);

        let output = runner.run(&command).await?;
        let job_id = parse_job_id(&output.stdout, &output.stderr)?;
        info!("HPC job submitted with id {}", job_id);

        Ok(Self {
            job_id,
            runner,
            poll_interval: HpcConfig::JOB_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Full `scontrol` description of the job.
    pub async fn describe(&self) -> Result<String> {
        let command = format!("scontrol show jobid -dd {}", self.job_id);
        let output = self.runner.run(&command).await?;
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(MapdlError::Scheduler {
                command,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Current `JobState`, if the scheduler reports one.
    pub async fn state(&self) -> Result<Option<String>> {
        Ok(parse_job_state(&self.describe().await?))
    }

    /// Poll until the job is RUNNING and return the IP of its batch host.
    pub async fn wait_for_running(&self, timeout: Duration, cancel: &CancellationToken) -> Result<String> {
        debug!("Waiting up to {:?} for HPC job {} to start", timeout, self.job_id);
        let deadline = Instant::now() + timeout;
        let mut last_state = String::from("UNKNOWN");

        loop {
            cancel.check()?;
            let description = self.describe().await?;
            if let Some(state) = parse_job_state(&description) {
                last_state = state;
            }

            if last_state == HpcConfig::RUNNING_STATE {
                let host = parse_batch_host(&description).ok_or_else(|| MapdlError::Scheduler {
                    command: format!("scontrol show jobid -dd {}", self.job_id),
                    message: "running job reports no BatchHost".to_string(),
                })?;
                let ip = match to_ip_address(&host) {
                    Ok(ip) => ip,
                    Err(e) => {
                        warn!("Could not resolve batch host '{}': {}; using the name", host, e);
                        host.clone()
                    }
                };
                info!("HPC job {} is running on {} ({})", self.job_id, host, ip);
                return Ok(ip);
            }

            if Instant::now() >= deadline {
                return Err(MapdlError::HpcJobTimeout {
                    job_id: self.job_id,
                    state: last_state,
                    timeout,
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Err(MapdlError::Cancelled),
            }
        }
    }

    /// Cancel the job with `scancel`.
    pub async fn cancel(&self) -> Result<()> {
        let command = format!("scancel {}", self.job_id);
        let output = self.runner.run(&command).await?;
        if !output.success() {
            return Err(MapdlError::Scheduler {
                command,
                message: output.stderr.trim().to_string(),
            });
        }
        info!("HPC job {} cancelled", self.job_id);
        Ok(())
    }
}

/// Submit and wait for the job to run, cancelling it on any later failure.
///
/// Returns the job and the IP address of its batch host.
pub async fn submit_and_wait(
    runner: Arc<dyn CommandRunner>,
    argv: &[String],
    options: Option<&SchedulerOptions>,
    timeout: Duration,
    cancel_on_failure: bool,
    cancel: &CancellationToken,
) -> Result<(HpcJob, String)> {
    let job = HpcJob::submit(runner, argv, options).await?;
    match job.wait_for_running(timeout, cancel).await {
        Ok(ip) => Ok((job, ip)),
        Err(err) => {
            if cancel_on_failure {
                if let Err(e) = job.cancel().await {
                    warn!("Failed to cancel HPC job {}: {}", job.job_id(), e);
                }
            }
            Err(err)
        }
    }
}
