//! Tailing of the license client log (`licdebug`).
//!
//! The license client appends one record per checkout attempt. A record
//! containing `CHECKOUT` means the solver got its license; `DENIED` is
//! followed by indented lines explaining why.

use crate::config::LicenseConfig;
use crate::error::{MapdlError, Result};
use crate::options::SolverVersion;
use crate::platform::paths;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// File name of the license client log for a solver version.
///
/// `licdebug.<host>.<app>.<version>.out` from 22.1 on,
/// `licdebug.<app>.<version>.out` before.
pub fn licdebug_name(version: SolverVersion, hostname: &str) -> String {
    let version = version.as_u32();
    if version < LicenseConfig::HOSTNAME_IN_LOG_SINCE {
        format!("licdebug.{}.{}.out", LicenseConfig::APP_NAME, version)
    } else {
        format!("licdebug.{}.{}.{}.out", hostname, LicenseConfig::APP_NAME, version)
    }
}

async fn wait_for_file(path: &Path, wait: Duration) -> Result<()> {
    let deadline = Instant::now() + wait;
    while !tokio::fs::try_exists(path).await.unwrap_or(false) {
        if Instant::now() >= deadline {
            return Err(MapdlError::LicenseTimeout(wait));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Watch `log_file` for new records until a checkout or denial appears.
///
/// Only content written after the call is considered. Returns `Ok(())` on
/// `CHECKOUT`, [`MapdlError::LicenseDenied`] on `DENIED` and
/// [`MapdlError::LicenseTimeout`] when neither shows up in time.
pub async fn check_license_file(log_file: &Path, timeout: Duration) -> Result<()> {
    debug!("Watching license log {} for {:?}", log_file.display(), timeout);
    wait_for_file(log_file, LicenseConfig::LOG_FILE_WAIT).await?;

    let mut file = tokio::fs::File::open(log_file)
        .await
        .map_err(|e| MapdlError::io_with_path(e, log_file))?;
    file.seek(SeekFrom::End(0)).await?;

    let deadline = Instant::now() + timeout;
    let mut pending = String::new();
    let mut denied: Option<Vec<String>> = None;

    loop {
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk).await?;
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let line = line.trim_end().to_string();

            if let Some(lines) = denied.as_mut() {
                if line.trim().is_empty() {
                    return Err(MapdlError::LicenseDenied { line: lines.join("\n") });
                }
                lines.push(line.trim().to_string());
                continue;
            }
            if line.contains("DENIED") {
                denied = Some(vec![line]);
            } else if line.contains("CHECKOUT") {
                info!("License checked out: {}", line.trim());
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            return match denied {
                Some(lines) => Err(MapdlError::LicenseDenied { line: lines.join("\n") }),
                None => Err(MapdlError::LicenseTimeout(timeout)),
            };
        }

        if denied.is_some() && chunk.is_empty() {
            // Nothing more was flushed after the denial record
            if let Some(lines) = denied.take() {
                return Err(MapdlError::LicenseDenied { line: lines.join("\n") });
            }
        }

        tokio::time::sleep(LicenseConfig::LOG_POLL_INTERVAL).await;
    }
}

/// Background check of the license log while the solver starts.
#[derive(Debug)]
pub struct LicenseChecker {
    log_file: PathBuf,
    timeout: Duration,
    task: Option<JoinHandle<Result<()>>>,
}

impl LicenseChecker {
    pub fn new(log_file: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            log_file: log_file.into(),
            timeout,
            task: None,
        }
    }

    /// Checker for the default log of `version` on this host.
    pub fn for_version(version: SolverVersion) -> Result<Self> {
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        let log_file = paths::licdebug_dir()?.join(licdebug_name(version, &hostname));
        Ok(Self::new(log_file, LicenseConfig::CHECK_TIMEOUT))
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Start watching in a background task.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let log_file = self.log_file.clone();
        let timeout = self.timeout;
        self.task = Some(tokio::spawn(async move {
            check_license_file(&log_file, timeout).await
        }));
    }

    /// The outcome if the check has already finished.
    ///
    /// `Some(Ok(()))` after a checkout, `Some(Err(..))` after a denial or
    /// timeout, `None` while still running or when never started.
    pub async fn finished(&mut self) -> Option<Result<()>> {
        if !self.task.as_ref().map(JoinHandle::is_finished).unwrap_or(false) {
            return None;
        }
        self.wait().await
    }

    /// Wait for the check to finish.
    pub async fn wait(&mut self) -> Option<Result<()>> {
        let task = self.task.take()?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(Err(MapdlError::Internal(format!("license check task failed: {}", e)))),
        }
    }

    /// Stop watching.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LicenseChecker {
    fn drop(&mut self) {
        self.abort();
    }
}
