use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::HailstormError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Retry behaviour as data: bounded attempts with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to 250 ms of random jitter per delay to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all; the operation runs exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before the given 1-based retry attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if self.jitter {
            let jitter_ms = rand::thread_rng().gen_range(0..250);
            capped + Duration::from_millis(jitter_ms)
        } else {
            capped
        }
    }
}

// ---------------------------------------------------------------------------
// retry / wait_for
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, fails non-transiently, or the attempt budget
/// is exhausted. Only [`HailstormError::is_transient`] failures are retried.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, HailstormError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HailstormError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_before(attempt);
                warn!(label, attempt, ?delay, %err, "transient failure, retrying");
                sleep(delay).await;
            }
            Err(err) => {
                debug!(label, attempt, %err, "giving up");
                return Err(err);
            }
        }
    }
}

/// Poll `predicate` every `interval` until it reports `true`.
///
/// Transient predicate failures count as "not yet"; any other error
/// propagates immediately. Raises [`HailstormError::Timeout`] carrying
/// `label` once `timeout` elapses.
pub async fn wait_for<F, Fut>(
    label: &str,
    timeout: Duration,
    interval: Duration,
    mut predicate: F,
) -> Result<(), HailstormError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, HailstormError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match predicate().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_transient() => {
                debug!(label, %err, "transient failure during wait, polling on");
            }
            Err(err) => return Err(err),
        }
        if Instant::now() >= deadline {
            return Err(HailstormError::Timeout(label.to_string()));
        }
        sleep(interval).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
