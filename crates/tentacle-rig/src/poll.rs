//! Bounded polling for hardware to reach a condition

use crate::{RigError, RigResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::trace;

/// Polls a probe at a fixed interval until it yields a value or time runs out.
///
/// The sleep between probes is the only suspension point, so dropping the
/// future cancels the wait cleanly.
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    timeout: Duration,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `probe` until it returns `Some`, failing with `HardwareTimeout`.
    ///
    /// The probe always runs at least once. Errors from the probe end the wait.
    pub async fn until<T, F, Fut>(&self, what: &str, mut probe: F) -> RigResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RigResult<Option<T>>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(value) = probe().await? {
                trace!(what, attempts, "condition reached");
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(RigError::timeout(what, self.timeout));
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}
