//! SLURM allocation detection.
//!
//! When the launcher itself runs inside a SLURM job, the allocation decides
//! the default core count, memory and job name.

use super::env::EnvSnapshot;
use crate::config::EnvVars;
use crate::error::{MapdlError, Result};
use tracing::info;

/// Resources of the SLURM allocation this process runs in.
#[derive(Debug, Clone, PartialEq)]
pub struct SlurmAllocation {
    pub job_name: String,
    pub job_id: String,
    pub nnodes: u32,
    pub ntasks: u32,
    pub cpus_per_task: u32,
    pub nprocs: u32,
    pub cpus_on_node: u32,
    /// Raw `SLURM_MEM_PER_NODE`, upper-cased.
    pub mem_per_node: Option<String>,
}

impl SlurmAllocation {
    /// Detect an allocation.
    ///
    /// Returns `None` unless `running_on_hpc` is requested, the opt-out
    /// variable is not `false`, and both job name and id are set.
    pub fn detect(env: &EnvSnapshot, running_on_hpc: bool) -> Result<Option<Self>> {
        if !running_on_hpc {
            return Ok(None);
        }
        if env.get_bool(EnvVars::RUNNING_ON_HPC)? == Some(false) {
            return Ok(None);
        }
        let (Some(job_name), Some(job_id)) =
            (env.get(EnvVars::SLURM_JOB_NAME), env.get(EnvVars::SLURM_JOB_ID))
        else {
            return Ok(None);
        };

        let count = |name: &str| env.get_u32(name).map(|v| v.unwrap_or(1));
        let allocation = Self {
            job_name: job_name.to_string(),
            job_id: job_id.to_string(),
            nnodes: count(EnvVars::SLURM_NNODES)?,
            ntasks: count(EnvVars::SLURM_NTASKS)?,
            cpus_per_task: count(EnvVars::SLURM_CPUS_PER_TASK)?,
            nprocs: count(EnvVars::SLURM_NPROCS)?,
            cpus_on_node: count(EnvVars::SLURM_CPUS_ON_NODE)?,
            mem_per_node: env.get(EnvVars::SLURM_MEM_PER_NODE).map(str::to_uppercase),
        };
        info!(
            "Running inside SLURM job {} ({}): {} node(s), {} task(s)",
            allocation.job_id, allocation.job_name, allocation.nnodes, allocation.ntasks
        );
        Ok(Some(allocation))
    }

    /// Number of cores the allocation grants.
    pub fn nproc(&self) -> u32 {
        [
            self.cpus_per_task * self.ntasks,
            self.nprocs,
            self.cpus_on_node * self.nnodes,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }

    /// Memory per node in gigabytes. A bare number is megabytes.
    pub fn ram_gb(&self) -> Result<Option<f64>> {
        let Some(raw) = self.mem_per_node.as_deref() else {
            return Ok(None);
        };

        let invalid = || MapdlError::InvalidEnvVar {
            name: EnvVars::SLURM_MEM_PER_NODE.to_string(),
            value: raw.to_string(),
            expected: "a memory size with an optional K, M, G or T suffix".to_string(),
        };

        let (digits, unit) = match raw.chars().last() {
            Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], Some(c)),
            _ => (raw, None),
        };
        let amount: f64 = digits.parse::<u64>().map_err(|_| invalid())? as f64;

        let gb = match unit {
            None | Some('M') => amount / 1024.0,
            Some('K') => amount / (1024.0 * 1024.0),
            Some('G') => amount,
            Some('T') => amount * 1024.0,
            Some(_) => return Err(invalid()),
        };
        Ok(Some(gb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slurm_env(extra: &[(&str, &str)]) -> EnvSnapshot {
        let mut pairs = vec![
            (EnvVars::SLURM_JOB_NAME, "job"),
            (EnvVars::SLURM_JOB_ID, "1001"),
        ];
        pairs.extend_from_slice(extra);
        EnvSnapshot::from_pairs(pairs)
    }

    #[test]
    fn test_detect_requires_job_name_and_id() {
        let env = EnvSnapshot::from_pairs([(EnvVars::SLURM_JOB_ID, "1")]);
        assert!(SlurmAllocation::detect(&env, true).unwrap().is_none());
        assert!(SlurmAllocation::detect(&slurm_env(&[]), true).unwrap().is_some());
        assert!(SlurmAllocation::detect(&slurm_env(&[]), false).unwrap().is_none());
    }

    #[test]
    fn test_detect_honours_opt_out() {
        let env = slurm_env(&[(EnvVars::RUNNING_ON_HPC, "FALSE")]);
        assert!(SlurmAllocation::detect(&env, true).unwrap().is_none());
    }

    #[test]
    fn test_nproc_takes_largest_product() {
        let env = slurm_env(&[
            (EnvVars::SLURM_NNODES, "2"),
            (EnvVars::SLURM_NTASKS, "4"),
            (EnvVars::SLURM_CPUS_PER_TASK, "2"),
            (EnvVars::SLURM_CPUS_ON_NODE, "6"),
        ]);
        let alloc = SlurmAllocation::detect(&env, true).unwrap().unwrap();
        assert_eq!(alloc.nproc(), 12);
        assert_eq!(alloc.job_name, "job");
    }

    #[test]
    fn test_ram_units() {
        let ram = |value: &str| {
            let env = slurm_env(&[(EnvVars::SLURM_MEM_PER_NODE, value)]);
            SlurmAllocation::detect(&env, true)
                .unwrap()
                .unwrap()
                .ram_gb()
        };
        assert_eq!(ram("2048").unwrap(), Some(2.0));
        assert_eq!(ram("4g").unwrap(), Some(4.0));
        assert_eq!(ram("1T").unwrap(), Some(1024.0));
        assert_eq!(ram("512M").unwrap(), Some(0.5));
        assert!(ram("3X").is_err());
    }
}
