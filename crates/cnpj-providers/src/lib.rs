//! Provider client contract and the two implementations shipped with
//! this crate: an HTTP-backed client for real providers, and an in-memory
//! stub for tests and demo runs.
//!
//! Providers never retry or sleep themselves — they classify exactly one
//! HTTP round-trip into a [`cnpj_core::ProviderOutcome`] and hand the rest
//! of the decision-making back to the router.

pub mod http;
pub mod stub;

pub use cnpj_core::ProviderOutcome;
pub use http::HttpProviderClient;
pub use stub::StubProviderClient;

use async_trait::async_trait;

/// A capability to look up a CNPJ against one external data source.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// The provider's name, used for scoring, logging, and attribution on
    /// the resulting [`cnpj_core::CompanyRecord`].
    fn name(&self) -> &str;

    /// Performs exactly one lookup. Never retries internally.
    async fn query(&self, cnpj: &cnpj_core::Cnpj) -> ProviderOutcome;
}
