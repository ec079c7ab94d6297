//! A monotonic-clock token bucket with an adjustable safety factor.

use std::time::Instant;

/// Lower and upper bounds a [`TokenBucket`]'s safety factor is clamped to.
pub const SAFETY_FACTOR_MIN: f64 = 0.3;
pub const SAFETY_FACTOR_MAX: f64 = 1.0;

/// Per-provider rate accountant. `limit_per_minute` is the provider's
/// declared hard limit; `safety_factor` shaves headroom off it so the
/// effective capacity stays a notch under the real ceiling.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    limit_per_minute: u32,
    safety_factor: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket starting full at its effective capacity.
    pub fn new(limit_per_minute: u32, safety_factor: f64) -> Self {
        let safety_factor = safety_factor.clamp(SAFETY_FACTOR_MIN, SAFETY_FACTOR_MAX);
        let mut bucket = Self {
            limit_per_minute,
            safety_factor,
            tokens: 0.0,
            last_refill: Instant::now(),
        };
        bucket.tokens = bucket.effective_capacity();
        bucket
    }

    /// `floor(limit_per_minute * safety_factor)`, minimum 1.
    pub fn effective_capacity(&self) -> f64 {
        ((self.limit_per_minute as f64) * self.safety_factor)
            .floor()
            .max(1.0)
    }

    /// Tokens granted per second at the current safety factor.
    pub fn refill_rate(&self) -> f64 {
        (self.limit_per_minute as f64) * self.safety_factor / 60.0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = self.effective_capacity();
        self.tokens = (self.tokens + elapsed * self.refill_rate()).min(capacity);
        self.last_refill = now;
    }

    /// Attempts to take one token. Non-blocking.
    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until a token would be available, `0.0` if one is available
    /// now.
    pub fn time_until_available(&mut self) -> f64 {
        self.refill();
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_rate()
        }
    }

    /// Nudges the safety factor by `delta`, clamped to the configured
    /// bounds.
    pub fn adjust_safety(&mut self, delta: f64) {
        self.safety_factor = (self.safety_factor + delta).clamp(SAFETY_FACTOR_MIN, SAFETY_FACTOR_MAX);
    }

    pub fn safety_factor(&self) -> f64 {
        self.safety_factor
    }

    pub fn set_safety_factor(&mut self, value: f64) {
        self.safety_factor = value.clamp(SAFETY_FACTOR_MIN, SAFETY_FACTOR_MAX);
    }

    /// Fractional tokens currently available, after a refill.
    pub fn tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn starts_full_at_effective_capacity() {
        let mut bucket = TokenBucket::new(60, 0.8);
        assert_eq!(bucket.effective_capacity(), 48.0);
        assert!((bucket.tokens() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn try_take_drains_and_refills() {
        let mut bucket = TokenBucket::new(60, 1.0);
        for _ in 0..60 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());

        sleep(Duration::from_millis(20));
        // at 1 token/sec, 20ms isn't enough for a full token yet in general,
        // but time_until_available should shrink toward zero.
        let wait = bucket.time_until_available();
        assert!(wait >= 0.0);
    }

    #[test]
    fn effective_capacity_has_a_floor_of_one() {
        let bucket = TokenBucket::new(1, 0.3);
        assert_eq!(bucket.effective_capacity(), 1.0);
    }

    #[test]
    fn safety_factor_clamps_to_bounds() {
        let mut bucket = TokenBucket::new(10, 0.5);
        bucket.adjust_safety(10.0);
        assert_eq!(bucket.safety_factor(), SAFETY_FACTOR_MAX);
        bucket.adjust_safety(-10.0);
        assert_eq!(bucket.safety_factor(), SAFETY_FACTOR_MIN);
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let mut bucket = TokenBucket::new(10, 1.0);
        sleep(Duration::from_millis(50));
        assert!(bucket.tokens() <= bucket.effective_capacity());
    }
}
