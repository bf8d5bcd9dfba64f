//! Reconnection backoff policies.
//!
//! The socket calls [`ReconnectionPolicy::next`] once per failed or lost
//! connection and [`ReconnectionPolicy::reset`] once per successful open.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stateful backoff strategy
pub trait ReconnectionPolicy: Send + Debug {
    /// Delay before the next connection attempt; advances internal state
    fn next(&mut self) -> Duration;

    /// Return to the initial state after a healthy connection
    fn reset(&mut self);
}

/// Policy shared between the options snapshot and the reconnect loop
pub type SharedPolicy = Arc<Mutex<dyn ReconnectionPolicy>>;

/// Wrap a policy for use in [`crate::SocketOptions`]
pub fn shared<P: ReconnectionPolicy + 'static>(policy: P) -> SharedPolicy {
    Arc::new(Mutex::new(policy))
}

/// Exponential backoff: `min(max_delay, base_delay * 2^retries)`
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    retries: u32,
}

impl ExponentialReconnectionPolicy {
    /// Create a policy with the given base and ceiling
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            retries: 0,
        }
    }

    /// Number of `next()` calls since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(20))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn next(&mut self) -> Duration {
        // Past 2^31 the ceiling has long since won
        let factor = 1u32.checked_shl(self.retries.min(31)).unwrap_or(u32::MAX);
        self.retries = self.retries.saturating_add(1);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}

/// Constant delay between attempts
#[derive(Debug, Clone)]
pub struct FixedReconnectionPolicy {
    delay: Duration,
}

impl FixedReconnectionPolicy {
    /// Always wait `delay`
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for FixedReconnectionPolicy {
    fn next(&mut self) -> Duration {
        self.delay
    }

    fn reset(&mut self) {}
}
