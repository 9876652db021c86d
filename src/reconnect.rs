//! Reconnection backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter, capped at a maximum delay.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub base: Duration,
    /// Multiplier applied per failed attempt.
    pub factor: f64,
    /// Upper bound on the computed delay.
    pub max: Duration,
    /// Random jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            factor: 2.0,
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// The delay for the given attempt number (0-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exact = self.base.as_secs_f64() * self.factor.powi(attempt.min(32) as i32);
        let capped = exact.min(self.max.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Per-connection backoff state.
///
/// Guarantees at most one pending reconnection attempt: `arm` returns the
/// delay only for the first disconnect report; later reports are absorbed
/// until [`Backoff::fired`] marks the scheduled attempt as started.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    pending: bool,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            pending: false,
        }
    }

    /// Arm a reconnection attempt. `None` if one is already pending.
    pub(crate) fn arm(&mut self) -> Option<Duration> {
        if self.pending {
            return None;
        }
        self.pending = true;
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// The scheduled attempt is now running; a later disconnect may arm again.
    pub(crate) fn fired(&mut self) {
        self.pending = false;
    }

    /// Registration succeeded; start the next outage from the base delay.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.pending = false;
    }
}
