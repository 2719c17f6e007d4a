// Reconnect delay policies for the WebSocket transport
//
// Fixed interval is the default; capped exponential backoff is opt-in through
// `websocket.backoff`.

use std::fmt::Debug;
use std::time::Duration;

/// Decides how long to wait before reconnect attempt `attempt` (0-based).
///
/// The attempt counter restarts at 0 whenever a session reaches `Ready`.
pub trait ReconnectPolicy: Send + Sync + Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay before every attempt
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval {
    interval: Duration,
}

impl FixedInterval {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl ReconnectPolicy for FixedInterval {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// Doubling delay, capped at `max`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}
