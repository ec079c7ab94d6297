//! Job status, provider outcomes, and the normalized company record.

use serde::{Deserialize, Serialize};

/// Status of the latest attempt to enrich a CNPJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
    RateLimited,
}

impl JobStatus {
    /// Returns `true` for statuses a reaper or admin restart may move back
    /// to [`JobStatus::Queued`].
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Error)
    }

    /// Returns `true` if no further worker action is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::RateLimited)
    }

    /// The stored string form, used as the SQL column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Parses the stored string form back into a status.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }
}

/// The classified result of a single provider call, per the provider
/// contract: providers never retry or sleep themselves, they only report
/// which bucket their response falls into.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum ProviderOutcome {
    /// The provider returned a usable record.
    Ok(CompanyRecord),
    /// The provider confirmed the CNPJ does not exist. Permanent.
    NotFound,
    /// The provider signaled overload (HTTP 429 or equivalent).
    RateLimited,
    /// Network failure, 5xx, or an unparsable response. Retriable.
    TransientError(String),
    /// The request itself was malformed in a way the provider rejected.
    /// Permanent.
    Invalid(String),
}

/// One partner listed against a company registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    pub name: String,
    pub qualification: String,
}

/// Normalized company data, a superset of the fields any single provider
/// returns. Fields a given provider never supplies are left `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompanyRecord {
    pub cnpj: String,
    pub legal_name: Option<String>,
    pub trade_name: Option<String>,
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub neighborhood: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub registration_status: Option<String>,
    pub primary_activity_code: Option<String>,
    pub secondary_activity_codes: Vec<String>,
    pub simples_nacional: Option<bool>,
    pub partners: Vec<Partner>,
    pub provider_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_string_form() {
        for s in [
            JobStatus::Queued,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Error,
            JobStatus::RateLimited,
        ] {
            assert_eq!(JobStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn only_error_and_rate_limited_are_retryable() {
        assert!(JobStatus::Error.is_retryable());
        assert!(JobStatus::RateLimited.is_retryable());
        assert!(!JobStatus::Completed.is_retryable());
        assert!(!JobStatus::Queued.is_retryable());
        assert!(!JobStatus::Processing.is_retryable());
    }
}
