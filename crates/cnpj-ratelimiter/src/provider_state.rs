//! Per-provider bucket plus the feedback state the selector scores on.

use std::time::{Duration, Instant};

use crate::bucket::TokenBucket;

/// Providers at or below this declared limit start with the low safety
/// factor; above it they start with the high one.
pub const DEFAULT_SAFETY_THRESHOLD: u32 = 3;
pub const DEFAULT_SAFETY_LOW: f64 = 0.7;
pub const DEFAULT_SAFETY_HIGH: f64 = 0.8;

pub const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_secs(60);
pub const DEFAULT_COOLDOWN_MAX: Duration = Duration::from_secs(300);

/// Tunables for how [`ProviderState`] reacts to success/failure feedback.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackPolicy {
    pub safety_threshold: u32,
    pub safety_low: f64,
    pub safety_high: f64,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for FeedbackPolicy {
    fn default() -> Self {
        Self {
            safety_threshold: DEFAULT_SAFETY_THRESHOLD,
            safety_low: DEFAULT_SAFETY_LOW,
            safety_high: DEFAULT_SAFETY_HIGH,
            cooldown_base: DEFAULT_COOLDOWN_BASE,
            cooldown_max: DEFAULT_COOLDOWN_MAX,
        }
    }
}

#[derive(Debug)]
pub struct ProviderState {
    pub(crate) bucket: TokenBucket,
    pub(crate) enabled: bool,
    pub(crate) last_used: Option<Instant>,
    pub(crate) cooldown_until: Option<Instant>,
    pub(crate) consecutive_errors: u32,
    pub(crate) consecutive_successes: u32,
    policy: FeedbackPolicy,
}

impl ProviderState {
    pub fn new(limit_per_minute: u32, enabled: bool, policy: FeedbackPolicy) -> Self {
        let safety = if limit_per_minute <= policy.safety_threshold {
            policy.safety_low
        } else {
            policy.safety_high
        };
        Self {
            bucket: TokenBucket::new(limit_per_minute, safety),
            enabled,
            last_used: None,
            cooldown_until: None,
            consecutive_errors: 0,
            consecutive_successes: 0,
            policy,
        }
    }

    pub fn is_in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn token_score(&mut self) -> f64 {
        let capacity = self.bucket.effective_capacity();
        if capacity <= 0.0 {
            0.0
        } else {
            self.bucket.tokens() / capacity
        }
    }

    pub fn time_score(&self, now: Instant) -> f64 {
        match self.last_used {
            None => 1.0,
            Some(last) => (now.saturating_duration_since(last).as_secs_f64() / 60.0).min(1.0),
        }
    }

    pub fn error_factor(&self) -> f64 {
        1.0 / (1.0 + self.consecutive_errors as f64)
    }

    pub fn has_token(&mut self) -> bool {
        self.bucket.tokens() >= 1.0
    }

    /// Marks the provider as consumed: takes one token and stamps
    /// `last_used`. Caller must already know a token was available.
    pub fn consume(&mut self, now: Instant) {
        self.bucket.try_take();
        self.last_used = Some(now);
    }

    pub fn on_success(&mut self) {
        self.consecutive_errors = 0;
        self.consecutive_successes += 1;
        if self.consecutive_successes % 10 == 0 {
            self.bucket.adjust_safety(0.05);
        }
    }

    /// Returns the cooldown duration just applied, for the caller to
    /// surface on an observability event.
    pub fn on_rate_limited(&mut self, now: Instant) -> Duration {
        self.consecutive_errors += 1;
        self.consecutive_successes = 0;
        self.bucket.adjust_safety(-0.1);
        let backoff = self.backoff_duration();
        self.cooldown_until = Some(now + backoff);
        backoff
    }

    /// Returns the cooldown duration just applied, for the caller to
    /// surface on an observability event.
    pub fn on_transient_error(&mut self, now: Instant) -> Duration {
        self.consecutive_errors += 1;
        self.consecutive_successes = 0;
        let backoff = self.backoff_duration();
        self.cooldown_until = Some(now + backoff);
        backoff
    }

    fn backoff_duration(&self) -> Duration {
        let exponent = self.consecutive_errors.saturating_sub(1).min(16);
        let scaled = self.policy.cooldown_base.as_secs_f64() * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(scaled.min(self.policy.cooldown_max.as_secs_f64()))
    }

    pub fn safety_factor(&self) -> f64 {
        self.bucket.safety_factor()
    }

    pub fn time_until_available(&mut self) -> f64 {
        self.bucket.time_until_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_limit_providers_start_at_low_safety() {
        let state = ProviderState::new(2, true, FeedbackPolicy::default());
        assert_eq!(state.safety_factor(), DEFAULT_SAFETY_LOW);
    }

    #[test]
    fn high_limit_providers_start_at_high_safety() {
        let state = ProviderState::new(60, true, FeedbackPolicy::default());
        assert_eq!(state.safety_factor(), DEFAULT_SAFETY_HIGH);
    }

    #[test]
    fn rate_limited_feedback_lowers_safety_and_sets_cooldown() {
        let mut state = ProviderState::new(60, true, FeedbackPolicy::default());
        let now = Instant::now();
        state.on_rate_limited(now);
        assert!(state.safety_factor() < DEFAULT_SAFETY_HIGH);
        assert!(state.is_in_cooldown(now));
        assert!(!state.is_in_cooldown(now + Duration::from_secs(61)));
    }

    #[test]
    fn cooldown_grows_exponentially_and_caps() {
        let mut state = ProviderState::new(60, true, FeedbackPolicy::default());
        let now = Instant::now();
        for _ in 0..10 {
            state.on_rate_limited(now);
        }
        // base 60s * 2^9 would blow past the 300s cap.
        assert!(state.cooldown_until.unwrap() <= now + Duration::from_secs(301));
    }

    #[test]
    fn success_does_not_raise_safety_before_ten_in_a_row() {
        let mut state = ProviderState::new(60, true, FeedbackPolicy::default());
        for _ in 0..9 {
            state.on_success();
        }
        assert_eq!(state.safety_factor(), DEFAULT_SAFETY_HIGH);
        state.on_success();
        assert!(state.safety_factor() > DEFAULT_SAFETY_HIGH || state.safety_factor() == 1.0);
    }
}
