//! Timeout-bounded waiting.
//!
//! Every suspension point in a harness run carries an explicit timeout. Two
//! shapes cover all of them: [`bounded`] wraps a single future whose
//! completion is the signal (a snapshot read, a load event), and
//! [`wait_for_result`] polls a condition until it holds (a page's
//! `document.readyState`).
//!
//! Both convert an expired deadline into [`HarnessError::Timeout`] so the
//! caller can record it and keep going with teardown.

use crate::error::{HarnessError, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Default timeout for a navigation load (10 seconds).
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for one partition context's snapshot read (2 seconds).
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default poll interval for checking conditions (100ms).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for polling waits.
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    /// Maximum time to wait for the condition.
    pub timeout: Duration,

    /// How often to check if the condition is satisfied.
    pub poll_interval: Duration,
}

impl WaitConfig {
    /// Creates a new wait configuration.
    #[must_use]
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LOAD_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

/// Awaits `future` for at most `timeout`.
///
/// On expiry the future is dropped, discarding whatever it had accumulated,
/// and a `Timeout` error naming `operation` is returned.
pub async fn bounded<F, T>(future: F, timeout: Duration, operation: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(HarnessError::timeout(operation, timeout)),
    }
}

/// Waits for a condition that returns a `Result<bool>`.
///
/// Errors from the condition are treated as transient and polling continues
/// until the timeout.
pub async fn wait_for_result<F, Fut>(
    condition: F,
    config: WaitConfig,
    description: &str,
) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();

    loop {
        match condition().await {
            Ok(true) => return Ok(()),
            Ok(false) | Err(_) => {}
        }

        if start.elapsed() >= config.timeout {
            return Err(HarnessError::timeout(description, config.timeout));
        }

        sleep(config.poll_interval).await;
    }
}
