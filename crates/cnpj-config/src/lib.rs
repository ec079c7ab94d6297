//! Environment-driven configuration.
//!
//! `Config` doubles as both a `clap`-derive CLI surface and an
//! environment-variable surface (`#[arg(env = "...")]`). A `.env` file, if
//! present, is loaded with `dotenvy` before parsing.
//!
//! Per-provider settings (`PROVIDER_<NAME>_ENABLED` / `PROVIDER_<NAME>_
//! LIMIT`) can't be named ahead of time in a derive struct, so they're
//! discovered separately by scanning the environment.

use std::collections::BTreeMap;
use std::time::Duration;

use cnpj_ratelimiter::ProviderSpec;

mod error;
pub use error::ConfigError;

/// Process-wide configuration, assembled from environment variables (and,
/// when used as a CLI, from flags of the same name).
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "cnpj-enrichment-queue", about = "CNPJ enrichment job queue")]
pub struct Config {
    /// Maximum number of enrichment calls in flight at once.
    #[arg(long, env = "MAX_CONCURRENT_PROCESSING", default_value_t = 4)]
    pub max_concurrent_processing: usize,

    /// Retry budget for transient/overload outcomes before a job is
    /// marked rate-limited.
    #[arg(long, env = "MAX_RETRY_ATTEMPTS", default_value_t = 3)]
    pub max_retry_attempts: u32,

    /// Whether to load pending jobs and heal stuck ones on boot.
    #[arg(long, env = "AUTO_RESTART_QUEUE", default_value_t = true)]
    pub auto_restart_queue: bool,

    /// Base cooldown applied after a provider signals overload, seconds.
    #[arg(long, env = "API_COOLDOWN_AFTER_RATE_LIMIT", default_value_t = 60)]
    pub cooldown_base_secs: u64,

    /// Cap on the exponential cooldown, seconds.
    #[arg(long, env = "API_COOLDOWN_MAX", default_value_t = 300)]
    pub cooldown_max_secs: u64,

    /// Initial safety factor for low-limit providers.
    #[arg(long, env = "SAFETY_FACTOR_LOW", default_value_t = 0.7)]
    pub safety_factor_low: f64,

    /// Initial safety factor for high-limit providers.
    #[arg(long, env = "SAFETY_FACTOR_HIGH", default_value_t = 0.8)]
    pub safety_factor_high: f64,

    /// Declared per-minute limit at or below which a provider starts at
    /// the low safety factor.
    #[arg(long, env = "SAFETY_THRESHOLD", default_value_t = 3)]
    pub safety_threshold: u32,

    /// Connection string for the persistent store.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://cnpj-queue.db")]
    pub database_url: String,

    #[arg(long, env = "REFILL_INTERVAL_SECS", default_value_t = 30)]
    pub refill_interval_secs: u64,

    #[arg(long, env = "REAPER_INTERVAL_SECS", default_value_t = 60)]
    pub reaper_interval_secs: u64,

    #[arg(long, env = "STUCK_THRESHOLD_SECS", default_value_t = 180)]
    pub stuck_threshold_secs: u64,

    #[arg(long, env = "PER_REQUEST_WAIT_SECS", default_value_t = 30)]
    pub per_request_wait_secs: u64,

    #[arg(long, env = "PROVIDER_HTTP_TIMEOUT_SECS", default_value_t = 30)]
    pub provider_http_timeout_secs: u64,
}

impl Config {
    /// Loads `.env` (if present) then parses `Config` from the
    /// environment, per `clap`'s `env` feature.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        <Config as clap::Parser>::parse()
    }

    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn per_request_wait(&self) -> Duration {
        Duration::from_secs(self.per_request_wait_secs)
    }

    pub fn provider_http_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_http_timeout_secs)
    }
}

/// Scans `std::env::vars()` for `PROVIDER_<NAME>_ENABLED` /
/// `PROVIDER_<NAME>_LIMIT` pairs and assembles one [`ProviderSpec`] per
/// distinct `<NAME>`. A provider with only one of the two keys set still
/// produces a spec (`enabled` defaults to `true`, `limit` defaults to 60)
/// so operators can lean on whichever default suits them.
pub fn discover_provider_specs() -> Result<Vec<ProviderSpec>, ConfigError> {
    Ok(discover_providers()?.into_iter().map(|p| p.spec).collect())
}

/// A discovered provider, carrying both its rate-limiting spec and the
/// (optional) base URL an `HttpProviderClient` would call. `url` is the
/// CLI's own ambient convention (`PROVIDER_<NAME>_URL`) for wiring a real
/// endpoint. Providers without a URL fall back to a stub client.
#[derive(Debug, Clone)]
pub struct DiscoveredProvider {
    pub spec: ProviderSpec,
    pub url: Option<String>,
}

pub fn discover_providers() -> Result<Vec<DiscoveredProvider>, ConfigError> {
    discover_providers_from(std::env::vars())
}

fn discover_providers_from(
    vars: impl Iterator<Item = (String, String)>,
) -> Result<Vec<DiscoveredProvider>, ConfigError> {
    #[derive(Default)]
    struct Partial {
        enabled: Option<bool>,
        limit: Option<u32>,
        url: Option<String>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();

    for (key, value) in vars {
        let Some(rest) = key.strip_prefix("PROVIDER_") else {
            continue;
        };
        if let Some(name) = rest.strip_suffix("_ENABLED") {
            let parsed = parse_bool(&key, &value)?;
            partials.entry(name.to_string()).or_default().enabled = Some(parsed);
        } else if let Some(name) = rest.strip_suffix("_LIMIT") {
            let parsed = parse_u32(&key, &value)?;
            partials.entry(name.to_string()).or_default().limit = Some(parsed);
        } else if let Some(name) = rest.strip_suffix("_URL") {
            partials.entry(name.to_string()).or_default().url = Some(value);
        }
    }

    Ok(partials
        .into_iter()
        .map(|(name, partial)| DiscoveredProvider {
            spec: ProviderSpec::new(
                name.to_lowercase(),
                partial.limit.unwrap_or(60),
                partial.enabled.unwrap_or(true),
            ),
            url: partial.url,
        })
        .collect())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
