//! # Fibonacci Backoff
//!
//! Progressive retry delays for reconciliation errors. Each failing resource
//! owns its own sequence so one noisy object does not slow down the others.

use std::time::Duration;

/// Fibonacci backoff in seconds, clamped to `[min_secs, max_secs]`
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    max_secs: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
            previous: 0,
            current: min_secs,
        }
    }

    /// Return the next delay and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let delay = self.current.min(self.max_secs);
        if self.current < self.max_secs {
            let next = self.previous.saturating_add(self.current);
            self.previous = self.current;
            self.current = next.max(self.min_secs);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = self.min_secs;
    }

    /// Delay for the given 0-indexed consecutive error count
    pub fn calculate_for_error_count(error_count: u32, min_secs: u64, max_secs: u64) -> Duration {
        let mut backoff = Self::new(min_secs, max_secs);
        let mut delay = backoff.next_backoff_seconds();
        for _ in 0..error_count {
            delay = backoff.next_backoff_seconds();
        }
        Duration::from_secs(delay)
    }
}
