//! An in-memory [`ProviderClient`] that replays a scripted sequence of
//! outcomes per CNPJ. Used by `cnpj-router`/`cnpj-queue` tests and the
//! CLI's `--demo` mode, so scenarios can be driven deterministically
//! without a network or real time.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use cnpj_core::{Cnpj, ProviderOutcome};

use crate::ProviderClient;

/// A scripted provider. Each call to `query` for a given CNPJ consumes the
/// next outcome in that CNPJ's queue; once exhausted, the `default`
/// outcome (if any) is returned, else [`ProviderOutcome::NotFound`].
pub struct StubProviderClient {
    name: String,
    scripts: Mutex<HashMap<String, Vec<ProviderOutcome>>>,
    default: Option<ProviderOutcome>,
    call_count: Mutex<usize>,
}

impl StubProviderClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            default: None,
            call_count: Mutex::new(0),
        }
    }

    /// Queues `outcomes` to be returned, in order, for `cnpj`.
    pub fn script(&self, cnpj: &str, outcomes: Vec<ProviderOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(cnpj.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Sets the outcome returned once a CNPJ's script is exhausted (or for
    /// CNPJs that were never scripted at all).
    pub fn with_default(mut self, outcome: ProviderOutcome) -> Self {
        self.default = Some(outcome);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl ProviderClient for StubProviderClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, cnpj: &Cnpj) -> ProviderOutcome {
        *self.call_count.lock().unwrap() += 1;

        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(cnpj.as_str()) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        self.default
            .clone()
            .unwrap_or(ProviderOutcome::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_scripted_outcomes_in_order() {
        let client = StubProviderClient::new("stub");
        client.script(
            "11222333000181",
            vec![ProviderOutcome::TransientError("boom".into()), ProviderOutcome::NotFound],
        );

        let cnpj = Cnpj::parse("11222333000181").unwrap();
        assert!(matches!(
            client.query(&cnpj).await,
            ProviderOutcome::TransientError(_)
        ));
        assert!(matches!(client.query(&cnpj).await, ProviderOutcome::NotFound));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_default_once_exhausted() {
        let client = StubProviderClient::new("stub").with_default(ProviderOutcome::RateLimited);
        let cnpj = Cnpj::parse("11222333000181").unwrap();
        assert!(matches!(client.query(&cnpj).await, ProviderOutcome::RateLimited));
    }
}
