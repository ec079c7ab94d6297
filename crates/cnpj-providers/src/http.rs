//! A generic `reqwest`-backed [`ProviderClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cnpj_core::{Cnpj, CompanyRecord, ProviderOutcome};

use crate::ProviderClient;

/// Default per-call deadline, per the queue's HTTP-deadline policy.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maps a provider's raw JSON response into a [`CompanyRecord`], or
/// explains why the payload couldn't be understood.
pub type ResponseMapper = Arc<dyn Fn(serde_json::Value) -> Result<CompanyRecord, String> + Send + Sync>;

/// A provider reached over HTTP. `base_url` is expected to accept the
/// canonical 14-digit CNPJ appended as a path segment
/// (`{base_url}/{cnpj}`); providers with a different URL shape can still
/// use this client by folding the shape into `base_url` construction at
/// call sites, or by wrapping a different [`ProviderClient`] impl.
pub struct HttpProviderClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
    mapper: ResponseMapper,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, mapper: ResponseMapper) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            mapper,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, cnpj: &Cnpj) -> ProviderOutcome {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), cnpj.as_str());

        let response = match tokio::time::timeout(self.timeout, self.client.get(&url).send()).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return ProviderOutcome::TransientError(err.to_string()),
            Err(_) => return ProviderOutcome::TransientError("request timed out".to_string()),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return ProviderOutcome::RateLimited;
        }
        if status.as_u16() == 404 {
            return ProviderOutcome::NotFound;
        }
        if status.is_client_error() {
            return ProviderOutcome::Invalid(format!("HTTP {status}"));
        }
        if status.is_server_error() {
            return ProviderOutcome::TransientError(format!("HTTP {status}"));
        }

        let body: serde_json::Value = match tokio::time::timeout(self.timeout, response.json()).await
        {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return ProviderOutcome::TransientError(format!("decode error: {err}")),
            Err(_) => return ProviderOutcome::TransientError("response read timed out".to_string()),
        };

        match (self.mapper)(body) {
            Ok(mut record) => {
                record.provider_name = self.name.clone();
                ProviderOutcome::Ok(record)
            }
            Err(reason) => ProviderOutcome::TransientError(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough_mapper() -> ResponseMapper {
        Arc::new(|value: serde_json::Value| {
            Ok(CompanyRecord {
                cnpj: value
                    .get("cnpj")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                legal_name: value
                    .get("legal_name")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                ..Default::default()
            })
        })
    }

    #[test]
    fn client_builder_sets_timeout() {
        let client = HttpProviderClient::new("acme", "https://example.invalid", passthrough_mapper())
            .with_timeout(Duration::from_secs(5));
        assert_eq!(client.timeout, Duration::from_secs(5));
        assert_eq!(client.name(), "acme");
    }
}
