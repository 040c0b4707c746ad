use std::time::Duration;

use tokio::time::Instant;

use crate::error::FleetResult;

/// Exponential backoff with jitter and an idle reset.
///
/// Delays grow by `factor` up to `cap`. When more than `reset_after` passes between two
/// calls the source is assumed healthy again and the delay restarts from `initial`.
/// All timing flows through `tokio::time`, so paused-clock tests drive it deterministically.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    cap: Duration,
    reset_after: Duration,
    factor: f64,
    jitter: f64,

    next: Duration,
    last_call: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(
        initial: Duration,
        cap: Duration,
        reset_after: Duration,
        factor: f64,
        jitter: f64,
    ) -> Self {
        Self {
            initial,
            cap,
            reset_after,
            factor,
            jitter,
            next: initial,
            last_call: None,
        }
    }

    /// The schedule used for list-and-watch relaunches and watch reconnects: 800ms
    /// doubling up to 30s, full jitter, reset after two quiet minutes.
    pub fn for_sync_loop() -> Self {
        Self::new(
            Duration::from_millis(800),
            Duration::from_secs(30),
            Duration::from_secs(120),
            2.0,
            1.0,
        )
    }

    /// Returns the next delay to sleep for.
    pub fn next_backoff(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_call {
            if now.saturating_duration_since(last) > self.reset_after {
                self.next = self.initial;
            }
        }
        self.last_call = Some(now);

        let current = self.next;
        self.next = self.next.mul_f64(self.factor).min(self.cap);

        if self.jitter > 0.0 {
            current + current.mul_f64(rand::random::<f64>() * self.jitter)
        } else {
            current
        }
    }
}

/// Retry budget for internal errors on a watch stream.
///
/// Internal errors are retried as long as they started less than `max_retry_duration`
/// ago; a quiet `min_reset_period` between errors reopens the budget. A zero
/// `max_retry_duration` disables retrying entirely.
#[derive(Debug)]
pub struct RetryWithDeadline {
    max_retry_duration: Duration,
    min_reset_period: Duration,
    first_error_time: Option<Instant>,
    last_error_time: Option<Instant>,
}

impl RetryWithDeadline {
    pub fn new(max_retry_duration: Duration, min_reset_period: Duration) -> Self {
        Self {
            max_retry_duration,
            min_reset_period,
            first_error_time: None,
            last_error_time: None,
        }
    }

    /// Records the outcome of one watch attempt. Only internal errors move the window.
    pub fn track(&mut self, result: &FleetResult<()>) {
        let Err(err) = result else { return };
        if !err.is_internal() {
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_error_time {
            if now.saturating_duration_since(last) >= self.min_reset_period {
                self.first_error_time = None;
            }
        }
        if self.first_error_time.is_none() {
            self.first_error_time = Some(now);
        }
        self.last_error_time = Some(now);
    }

    /// True while the tracked errors are still within the retry budget.
    pub fn should_retry(&self) -> bool {
        if self.max_retry_duration.is_zero() {
            return false;
        }
        match self.first_error_time {
            Some(first) => Instant::now().saturating_duration_since(first) <= self.max_retry_duration,
            None => false,
        }
    }
}
