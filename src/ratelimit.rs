//! Outbound rate limiting.
//!
//! A continuously-refilling token bucket gates how fast lines leave one
//! connection. Refill is fractional and capped, so an idle connection never
//! banks more than `burst` worth of instant sends; with the default burst
//! of one token the completions in any one-second sliding window never
//! exceed the configured rate. Sends that find the bucket empty are queued
//! by the writer (never dropped) and flushed in submission order.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Rate limit configuration, in messages per second.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained rate in messages per second.
    pub rate: f64,
    /// Maximum tokens the bucket may hold. Values above 1.0 permit short
    /// bursts after idle periods at the cost of the strict sliding-window
    /// bound.
    pub burst: f64,
}

impl RateLimit {
    /// A limit of `rate` messages per second with no burst allowance.
    pub fn per_second(rate: f64) -> Self {
        Self { rate, burst: 1.0 }
    }

    /// Permit a short burst of up to `burst` messages after idle.
    #[must_use]
    pub fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst.max(1.0);
        self
    }
}

/// A token bucket tracking one connection's send budget.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// A full bucket with the given limit.
    pub fn new(limit: RateLimit) -> Self {
        Self {
            rate: limit.rate,
            burst: limit.burst.max(1.0),
            tokens: limit.burst.max(1.0),
            refilled: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled = now;
    }

    /// Reserve one send: returns how long the caller must wait before the
    /// send may complete. `Duration::ZERO` means the token was available.
    ///
    /// The reservation is committed immediately (the bucket may go
    /// negative), so sequential callers are paced in submission order.
    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    /// [`Self::reserve`] with an explicit clock, for deterministic tests.
    pub fn reserve_at(&mut self, now: Instant) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }

    /// Whether a send could complete right now without waiting.
    pub fn ready_at(&mut self, now: Instant) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        self.refill(now);
        self.tokens >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_is_immediate() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(2.0));
        let t0 = Instant::now();
        assert_eq!(bucket.reserve_at(t0), Duration::ZERO);
    }

    #[test]
    fn sends_are_paced_at_rate() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(2.0));
        let t0 = Instant::now();
        assert_eq!(bucket.reserve_at(t0), Duration::ZERO);
        // Second immediate send must wait half a second at 2 msg/s.
        let wait = bucket.reserve_at(t0);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-9);
        let wait = bucket.reserve_at(t0);
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn idle_does_not_bank_a_burst() {
        let mut bucket = TokenBucket::new(RateLimit::per_second(4.0));
        let t0 = Instant::now();
        assert_eq!(bucket.reserve_at(t0), Duration::ZERO);
        // A long idle period refills to the burst cap (1 token), not more.
        let t1 = t0 + Duration::from_secs(3600);
        assert_eq!(bucket.reserve_at(t1), Duration::ZERO);
        assert!(bucket.reserve_at(t1) > Duration::ZERO);
    }

    #[test]
    fn sliding_window_bound_holds_after_idle() {
        // Property: at rate R, no 1-second window sees more than R
        // completions, no matter how long the idle gap was.
        let rate = 5.0;
        let mut bucket = TokenBucket::new(RateLimit::per_second(rate));
        let t0 = Instant::now() + Duration::from_secs(1000);
        let mut completions = Vec::new();
        for _ in 0..20 {
            let wait = bucket.reserve_at(t0);
            completions.push(t0 + wait);
        }
        for (i, start) in completions.iter().enumerate() {
            let window_end = *start + Duration::from_secs(1);
            let in_window = completions[i..]
                .iter()
                .filter(|&&c| c < window_end)
                .count();
            assert!(in_window as f64 <= rate, "window held {in_window} sends");
        }
    }

    #[test]
    fn zero_rate_is_unlimited() {
        let mut bucket = TokenBucket::new(RateLimit {
            rate: 0.0,
            burst: 1.0,
        });
        let t0 = Instant::now();
        for _ in 0..100 {
            assert_eq!(bucket.reserve_at(t0), Duration::ZERO);
        }
    }
}
