//! Poll-with-timeout primitive
//!
//! Remote state converges eventually (clone lock released, DHCP lease,
//! instance stopped). Instead of sleeping for a guessed duration, probe the
//! real state on an interval until it is ready or the budget runs out.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Probe interval and total budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self { interval_ms, timeout_ms }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
}

/// Run `probe` until it yields a value or `policy.timeout` has elapsed.
///
/// The probe always runs at least once, so a zero budget means "check once".
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, what: &str, mut probe: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = probe().await {
            debug!("{} ready after {} probe(s)", what, attempts);
            return Ok(value);
        }

        let waited = start.elapsed();
        if waited >= policy.timeout() {
            return Err(PollError::Timeout {
                what: what.to_string(),
                waited,
            });
        }
        sleep(policy.interval().min(policy.timeout() - waited)).await;
    }
}
