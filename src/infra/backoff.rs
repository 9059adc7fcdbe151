//! Exponential backoff for reconnects and retries

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Returned once a bounded backoff has used up its retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("maximum number of retries reached")]
pub struct MaxRetriesReached;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// 0 means unlimited
    max_retries: u32,
    current_delay: Duration,
    retries_remaining: Option<u32>,
    delays_issued: u64,
}

impl ExponentialBackoff {
    /// Parameters are clamped: initial delay >= 1ms, max delay >= initial
    /// delay, multiplier >= 1.
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        let initial_delay = initial_delay.max(Duration::from_millis(1));
        let max_delay = max_delay.max(initial_delay);
        let multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };

        Self {
            initial_delay,
            max_delay,
            multiplier,
            max_retries,
            current_delay: initial_delay,
            retries_remaining: (max_retries > 0).then_some(max_retries),
            delays_issued: 0,
        }
    }

    /// Unlimited backoff used for MQTT reconnects and table creation
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(15 * 60), 1.7, 0)
    }

    /// Bounded backoff used for failed batch writes
    pub fn write_retry() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 5)
    }

    /// True until the first delay has been handed out since creation or reset
    pub fn first_time(&self) -> bool {
        self.delays_issued == 0
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Take the current delay and grow the next one
    pub fn next_delay(&mut self) -> Result<Duration, MaxRetriesReached> {
        match self.retries_remaining {
            Some(0) => return Err(MaxRetriesReached),
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }

        let delay = self.current_delay;
        if self.current_delay < self.max_delay {
            self.current_delay = self.current_delay.mul_f64(self.multiplier).min(self.max_delay);
        }
        self.delays_issued += 1;
        Ok(delay)
    }

    /// Sleep for the next delay
    pub fn delay(&mut self) -> Result<tokio::time::Sleep, MaxRetriesReached> {
        self.next_delay().map(tokio::time::sleep)
    }

    /// Sleep for the next delay unless `cancel` fires first.
    ///
    /// Returns `Ok(false)` when cancelled.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<bool, MaxRetriesReached> {
        let sleep = self.delay()?;
        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            _ = sleep => Ok(true),
        }
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.retries_remaining = (self.max_retries > 0).then_some(self.max_retries);
        self.delays_issued = 0;
    }
}
