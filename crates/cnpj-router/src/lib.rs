//! Routes a single CNPJ lookup across whichever providers the adaptive
//! rate limiter currently favors, falling back to the next candidate when
//! one is overloaded or transiently failing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cnpj_core::{Cnpj, CompanyRecord, ProviderOutcome};
use cnpj_ratelimiter::AdaptiveRateLimiter;
use cnpj_providers::ProviderClient;

/// The final, terminal outcome of routing one CNPJ through every candidate
/// provider.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalError {
    /// A provider confirmed the CNPJ does not exist.
    NotFound,
    /// A provider rejected the request as malformed.
    Invalid(String),
    /// No provider became available within the per-request wait budget.
    NoProviderAvailable,
    /// Every candidate provider was tried and none succeeded.
    AllProvidersFailed { last_reason: String },
}

/// How long [`ProviderRouter::route`] waits for a provider to free up
/// before giving up with [`FinalError::NoProviderAvailable`].
pub const DEFAULT_PER_REQUEST_WAIT: Duration = cnpj_ratelimiter::limiter::DEFAULT_PER_REQUEST_WAIT;

pub struct ProviderRouter {
    limiter: Arc<AdaptiveRateLimiter>,
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    per_request_wait: Duration,
}

impl ProviderRouter {
    pub fn new(
        limiter: Arc<AdaptiveRateLimiter>,
        providers: Vec<Arc<dyn ProviderClient>>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self {
            limiter,
            providers,
            per_request_wait: DEFAULT_PER_REQUEST_WAIT,
        }
    }

    pub fn with_per_request_wait(mut self, wait: Duration) -> Self {
        self.per_request_wait = wait;
        self
    }

    /// Routes `cnpj` through the candidate set: pick a provider, consume
    /// a token, query it, and branch on the outcome. Transient/overload
    /// outcomes drop that provider from the candidate set and loop;
    /// permanent outcomes return immediately.
    pub async fn route(&self, cnpj: &Cnpj) -> Result<CompanyRecord, FinalError> {
        let mut candidates: Vec<String> = self.providers.keys().cloned().collect();
        let mut last_reason = String::new();

        while !candidates.is_empty() {
            let provider_name = match self.limiter.pick_provider(&candidates) {
                Some(name) => name,
                None => {
                    match self
                        .limiter
                        .wait_for_any(&candidates, self.per_request_wait)
                        .await
                    {
                        Some(name) => name,
                        None => return Err(FinalError::NoProviderAvailable),
                    }
                }
            };

            self.limiter.consume(&provider_name);

            let Some(client) = self.providers.get(&provider_name) else {
                candidates.retain(|c| c != &provider_name);
                continue;
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(provider = %provider_name, cnpj = %cnpj, "routing lookup");

            match client.query(cnpj).await {
                ProviderOutcome::Ok(record) => {
                    self.limiter.on_success(&provider_name);
                    return Ok(record);
                }
                ProviderOutcome::NotFound => {
                    self.limiter.on_success(&provider_name);
                    return Err(FinalError::NotFound);
                }
                ProviderOutcome::Invalid(reason) => {
                    self.limiter.on_success(&provider_name);
                    return Err(FinalError::Invalid(reason));
                }
                ProviderOutcome::RateLimited => {
                    self.limiter.on_rate_limited(&provider_name);
                    last_reason = format!("{provider_name}: rate limited");
                    candidates.retain(|c| c != &provider_name);
                }
                ProviderOutcome::TransientError(reason) => {
                    self.limiter.on_transient_error(&provider_name);
                    last_reason = format!("{provider_name}: {reason}");
                    candidates.retain(|c| c != &provider_name);
                }
            }
        }

        Err(FinalError::AllProvidersFailed { last_reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnpj_providers::StubProviderClient;
    use cnpj_ratelimiter::ProviderSpec;

    fn record(cnpj: &str) -> CompanyRecord {
        CompanyRecord {
            cnpj: cnpj.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_returns_the_providers_record() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 60, true)]));
        let stub = Arc::new(StubProviderClient::new("a"));
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        stub.script(cnpj.as_str(), vec![ProviderOutcome::Ok(record(cnpj.as_str()))]);

        let router = ProviderRouter::new(limiter, vec![stub]);
        let result = router.route(&cnpj).await;
        assert_eq!(result.unwrap().cnpj, cnpj.as_str());
    }

    #[tokio::test]
    async fn falls_back_to_next_provider_on_rate_limit() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(vec![
            ProviderSpec::new("a", 60, true),
            ProviderSpec::new("b", 60, true),
        ]));
        let a = Arc::new(StubProviderClient::new("a"));
        let b = Arc::new(StubProviderClient::new("b"));
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        a.script(cnpj.as_str(), vec![ProviderOutcome::RateLimited]);
        b.script(cnpj.as_str(), vec![ProviderOutcome::Ok(record(cnpj.as_str()))]);

        let router = ProviderRouter::new(limiter, vec![a, b]);
        let result = router.route(&cnpj).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn returns_not_found_without_retrying() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 60, true)]));
        let stub = Arc::new(StubProviderClient::new("a"));
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        stub.script(cnpj.as_str(), vec![ProviderOutcome::NotFound]);

        let router = ProviderRouter::new(limiter, vec![stub]);
        assert_eq!(router.route(&cnpj).await, Err(FinalError::NotFound));
    }

    #[tokio::test]
    async fn all_providers_failing_returns_all_providers_failed() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(vec![ProviderSpec::new("a", 60, true)]));
        let stub = Arc::new(StubProviderClient::new("a"));
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        stub.script(cnpj.as_str(), vec![ProviderOutcome::TransientError("boom".into())]);

        let router = ProviderRouter::new(limiter, vec![stub]);
        let result = router.route(&cnpj).await;
        assert!(matches!(result, Err(FinalError::AllProvidersFailed { .. })));
    }

    #[tokio::test]
    async fn no_providers_configured_yields_no_provider_available() {
        let limiter = Arc::new(AdaptiveRateLimiter::new(Vec::<cnpj_ratelimiter::ProviderSpec>::new()));
        let router = ProviderRouter::new(limiter, Vec::new());
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        assert_eq!(router.route(&cnpj).await, Err(FinalError::AllProvidersFailed {
            last_reason: String::new(),
        }));
    }
}
