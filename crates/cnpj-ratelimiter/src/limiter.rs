//! The adaptive, multi-provider rate limiter.
//!
//! Owns one [`ProviderState`] per provider behind a single `std::sync::
//! Mutex` — selection, consumption, and feedback are all short critical
//! sections, never held across an `.await`. Placing a provider in cooldown
//! emits a [`cnpj_core::LifecycleEvent::ProviderCooldown`] through
//! [`AdaptiveRateLimiter::add_listener`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cnpj_core::{EventListener, EventListeners, LifecycleEvent};
use rand::Rng;

use crate::provider_state::{FeedbackPolicy, ProviderState};
use crate::spec::ProviderSpec;

/// Weights for the composite provider-selection score.
const WEIGHT_TOKEN: f64 = 0.40;
const WEIGHT_TIME: f64 = 0.40;
const WEIGHT_ERROR: f64 = 0.15;
const MAX_JITTER: f64 = 0.05;

/// Default ceiling on a single `wait_for_any` call.
pub const DEFAULT_PER_REQUEST_WAIT: Duration = Duration::from_secs(30);

/// Poll granularity used by [`AdaptiveRateLimiter::wait_for_any`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Selects a provider for the next request and adjusts per-provider safety
/// over time based on observed outcomes.
pub struct AdaptiveRateLimiter {
    providers: Mutex<HashMap<String, ProviderState>>,
    events: Mutex<EventListeners<LifecycleEvent>>,
}

impl AdaptiveRateLimiter {
    /// Builds a limiter from static provider declarations, using the
    /// default feedback policy.
    pub fn new(specs: impl IntoIterator<Item = ProviderSpec>) -> Self {
        Self::with_policy(specs, FeedbackPolicy::default())
    }

    pub fn with_policy(
        specs: impl IntoIterator<Item = ProviderSpec>,
        policy: FeedbackPolicy,
    ) -> Self {
        let providers = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.name,
                    ProviderState::new(spec.limit_per_minute, spec.enabled, policy),
                )
            })
            .collect();
        Self {
            providers: Mutex::new(providers),
            events: Mutex::new(EventListeners::new()),
        }
    }

    /// Registers a listener notified of [`LifecycleEvent::ProviderCooldown`]
    /// events whenever `on_rate_limited`/`on_transient_error` place a
    /// provider in cooldown.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: EventListener<LifecycleEvent> + 'static,
    {
        self.events.lock().unwrap().add(listener);
    }

    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().emit(&event);
    }

    /// Names of all providers known to this limiter, enabled or not.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.lock().unwrap().keys().cloned().collect()
    }

    /// Picks the best-scoring provider among `candidates` that is enabled,
    /// not in cooldown, and has at least one token. Returns `None` if no
    /// candidate qualifies.
    pub fn pick_provider(&self, candidates: &[String]) -> Option<String> {
        let now = Instant::now();
        let mut providers = self.providers.lock().unwrap();

        let mut best: Option<(String, f64)> = None;
        for name in candidates {
            let Some(state) = providers.get_mut(name) else {
                continue;
            };
            if !state.enabled || state.is_in_cooldown(now) {
                continue;
            }
            if !state.has_token() {
                continue;
            }

            let token_score = state.token_score();
            let time_score = state.time_score(now);
            let error_factor = state.error_factor();
            let jitter = rand::rng().random_range(0.0..MAX_JITTER);

            let score = WEIGHT_TOKEN * token_score
                + WEIGHT_TIME * time_score
                + WEIGHT_ERROR * error_factor
                + jitter;

            match &best {
                Some((_, best_score)) if *best_score >= score => {}
                _ => best = Some((name.clone(), score)),
            }
        }

        best.map(|(name, _)| name)
    }

    /// Consumes one token from `provider`. Call immediately after
    /// `pick_provider` returns it; a provider must not be consumed twice
    /// for the same logical request.
    pub fn consume(&self, provider: &str) {
        let now = Instant::now();
        if let Some(state) = self.providers.lock().unwrap().get_mut(provider) {
            state.consume(now);
        }
    }

    pub fn on_success(&self, provider: &str) {
        if let Some(state) = self.providers.lock().unwrap().get_mut(provider) {
            state.on_success();
        }
    }

    pub fn on_rate_limited(&self, provider: &str) {
        let now = Instant::now();
        let backoff = {
            let mut providers = self.providers.lock().unwrap();
            providers.get_mut(provider).map(|state| state.on_rate_limited(now))
        };
        if let Some(backoff) = backoff {
            self.emit(LifecycleEvent::provider_cooldown(provider, backoff));
        }
    }

    pub fn on_transient_error(&self, provider: &str) {
        let now = Instant::now();
        let backoff = {
            let mut providers = self.providers.lock().unwrap();
            providers.get_mut(provider).map(|state| state.on_transient_error(now))
        };
        if let Some(backoff) = backoff {
            self.emit(LifecycleEvent::provider_cooldown(provider, backoff));
        }
    }

    /// Cooperatively waits, up to `timeout`, for any candidate to become
    /// selectable, then returns `pick_provider`'s result. Implemented as a
    /// short poll loop rather than a true interrupt, matching the
    /// cooperative-wait idiom this limiter's selection logic already uses.
    pub async fn wait_for_any(&self, candidates: &[String], timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(provider) = self.pick_provider(candidates) {
                return Some(provider);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Current safety factor for a provider, primarily for status
    /// reporting and tests.
    pub fn safety_factor(&self, provider: &str) -> Option<f64> {
        self.providers
            .lock()
            .unwrap()
            .get(provider)
            .map(|s| s.safety_factor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ProviderSpec> {
        vec![
            ProviderSpec::new("a", 3, true),
            ProviderSpec::new("b", 3, true),
            ProviderSpec::new("c", 60, true),
        ]
    }

    #[test]
    fn picks_a_provider_with_available_tokens() {
        let limiter = AdaptiveRateLimiter::new(specs());
        let candidates = limiter.provider_names();
        let picked = limiter.pick_provider(&candidates);
        assert!(picked.is_some());
    }

    #[test]
    fn disabled_providers_are_never_picked() {
        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 10, false)]);
        assert_eq!(limiter.pick_provider(&["a".to_string()]), None);
    }

    #[test]
    fn exhausted_bucket_is_not_picked_until_refill() {
        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 1, true)]);
        let candidates = vec!["a".to_string()];
        let picked = limiter.pick_provider(&candidates).unwrap();
        limiter.consume(&picked);
        assert_eq!(limiter.pick_provider(&candidates), None);
    }

    #[test]
    fn rate_limited_provider_is_excluded_during_cooldown() {
        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 10, true)]);
        let candidates = vec!["a".to_string()];
        limiter.on_rate_limited("a");
        assert_eq!(limiter.pick_provider(&candidates), None);
    }

    #[tokio::test]
    async fn wait_for_any_returns_none_on_timeout_when_all_cool_down() {
        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 10, true)]);
        limiter.on_rate_limited("a");
        let result = limiter
            .wait_for_any(&["a".to_string()], Duration::from_millis(150))
            .await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn wait_for_any_returns_as_soon_as_a_token_refills() {
        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 600, true)]);
        let candidates = vec!["a".to_string()];
        let first = limiter.pick_provider(&candidates).unwrap();
        limiter.consume(&first);
        // limit_per_minute=600 refills fast; should come back within budget.
        let result = limiter
            .wait_for_any(&candidates, Duration::from_secs(1))
            .await;
        assert!(result.is_some());
    }

    #[test]
    fn on_rate_limited_emits_a_provider_cooldown_event() {
        use cnpj_core::FnListener;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let limiter = AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 10, true)]);
        let seen = std::sync::Arc::new(AtomicUsize::new(0));
        let seen_clone = std::sync::Arc::clone(&seen);

        limiter.add_listener(FnListener::new(move |event: &LifecycleEvent| {
            assert_eq!(event.event_type(), "provider_cooldown");
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        limiter.on_rate_limited("a");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
