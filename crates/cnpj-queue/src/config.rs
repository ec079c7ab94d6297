//! Tunables for [`crate::JobQueue`].

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub max_concurrent: usize,
    pub refill_interval: Duration,
    pub reaper_interval: Duration,
    pub stuck_threshold: Duration,
    pub max_retries: u32,
    /// Minimum spacing between successive `route` starts, derived from
    /// `60 / sum(enabled provider limits)`.
    pub min_interval: Duration,
    /// Sum of `limit_per_minute` across enabled providers. Gates the
    /// refill task: it only tops up the in-memory queue while
    /// `in_memory + in_flight < 2 * total_provider_limit`. Defaults to a
    /// large sentinel so a caller that never wires real provider limits
    /// (e.g. most tests) keeps the old always-refill behavior.
    pub total_provider_limit: u32,
}

impl JobQueueConfig {
    /// Derives `min_interval` and the refill budget from the total
    /// per-minute capacity across enabled providers.
    pub fn with_total_provider_limit(mut self, total_limit_per_minute: u32) -> Self {
        let total = total_limit_per_minute.max(1);
        self.min_interval = Duration::from_secs_f64(60.0 / total as f64);
        self.total_provider_limit = total;
        self
    }
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            refill_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            stuck_threshold: Duration::from_secs(180),
            max_retries: 3,
            min_interval: Duration::from_millis(100),
            total_provider_limit: 1_000_000,
        }
    }
}
