//! Adaptive, multi-provider token-bucket rate limiting.
//!
//! [`bucket::TokenBucket`] is the single-provider accountant;
//! [`AdaptiveRateLimiter`] owns one bucket per provider, scores
//! candidates on token availability, recency, and error history, and backs
//! off providers that signal overload.

pub mod bucket;
pub mod limiter;
pub mod provider_state;
pub mod spec;

pub use bucket::TokenBucket;
pub use limiter::AdaptiveRateLimiter;
pub use provider_state::FeedbackPolicy;
pub use spec::ProviderSpec;
