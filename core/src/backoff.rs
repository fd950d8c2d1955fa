//! Exponential backoff for readiness polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Exponential backoff with configurable min/max.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for ExponentialBackoff {
    /// 10ms doubling up to 250ms, suited to polling a local listener.
    fn default() -> Self {
        Self::new(Duration::from_millis(10), Duration::from_millis(250))
    }
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next interval (doubles, capped at max).
    pub fn advance(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    /// Resets backoff to initial value.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Runs `check` until it returns true or `deadline` passes.
    ///
    /// Sleeps between attempts, never past the deadline. Returns whether the
    /// check succeeded.
    pub async fn poll_until<F, Fut>(&mut self, deadline: Instant, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        loop {
            if check().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.current.min(deadline - now)).await;
            self.advance();
        }
    }
}
