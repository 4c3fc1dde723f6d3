//! Connection attempts against a deadline.
//!
//! A connect budget is split across a fixed number of attempts so that one
//! stalled attempt cannot use up the whole timeout. Between attempts the
//! wait doubles, and a wait that would run past the deadline ends the
//! retries early.

use crate::config::NetworkConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a connect budget is spent.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts, including the first one.
    pub max_attempts: u32,
    /// Wait after the first failed attempt.
    pub base_delay: Duration,
    /// Longest wait between two attempts.
    pub max_delay: Duration,
    /// Randomize each wait between half and all of its nominal length.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::CONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The slice of `total` each attempt may use.
    pub fn attempt_timeout(&self, total: Duration) -> Duration {
        total / self.max_attempts.max(1)
    }

    /// Nominal wait after failed attempt `attempt` (0-based): the base delay
    /// doubled per attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let nominal = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let full = nominal.as_micros() as u64;
        Duration::from_micros(rand::rng().random_range(full / 2..=full))
    }

    /// The wait before the attempt following `attempt`, or `None` when no
    /// attempt is left or the wait would end past `deadline`.
    pub fn next_delay(&self, attempt: u32, deadline: Option<Instant>) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let delay = self.backoff(attempt);
        match deadline {
            Some(deadline) if Instant::now() + delay >= deadline => None,
            _ => Some(delay),
        }
    }
}

/// What a retried operation went through.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub waited: Duration,
    pub last_error: Option<String>,
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the budget in `config` and `deadline` is spent.
///
/// The operation receives the 0-based attempt number.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    deadline: Option<Instant>,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;
        let e = match operation(attempt).await {
            Ok(value) => return (Ok(value), stats),
            Err(e) => e,
        };
        stats.last_error = Some(e.to_string());

        if !should_retry(&e) {
            debug!("Not retrying after attempt {}: {}", attempt + 1, e);
            return (Err(e), stats);
        }
        let Some(delay) = config.next_delay(attempt, deadline) else {
            warn!("Giving up after {} attempts: {}", attempt + 1, e);
            return (Err(e), stats);
        };

        debug!(
            "Attempt {}/{} failed: {}. Next in {:?}",
            attempt + 1,
            config.max_attempts,
            e,
            delay
        );
        stats.waited += delay;
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
