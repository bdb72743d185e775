//! Sleep duration between probe cycles.
//!
//! Backoff policy:
//! - fixed 30 second retry after a transient failure;
//! - the operator-configured interval after a success.
use std::time::Duration;

/// Delay used after a failed pull or push.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalController {
    current: Duration,
    configured: Duration,
}

impl IntervalController {
    pub fn new(configured: Duration) -> Self {
        Self {
            current: configured,
            configured,
        }
    }

    /// How long to sleep before the next cycle.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn configured(&self) -> Duration {
        self.configured
    }

    pub fn on_success(&mut self) {
        self.current = self.configured;
    }

    pub fn on_transient_failure(&mut self) {
        self.current = RETRY_INTERVAL;
    }
}
