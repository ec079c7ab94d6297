//! Crate-spanning error type.
//!
//! Every `cnpj-*` crate composes its own error variants into this enum via
//! `#[from]`, so callers at the top of the stack (the supervisor, the CLI)
//! can match on a single type.
//!
//! ```
//! use cnpj_core::Error;
//!
//! let err = Error::InvalidCnpj { input: "123".into() };
//! assert!(err.is_invalid_cnpj());
//! ```

/// Errors shared across the CNPJ enrichment queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input did not canonicalize to exactly 14 digits.
    #[error("invalid CNPJ: {input:?}")]
    InvalidCnpj { input: String },

    /// No provider had capacity within the configured wait budget.
    #[error("no provider available for {cnpj}")]
    NoProviderAvailable { cnpj: String },

    /// Every candidate provider rejected the request.
    #[error("all providers failed for {cnpj}: {last_reason}")]
    AllProvidersFailed { cnpj: String, last_reason: String },

    /// A CNPJ was submitted while already queued or processing.
    #[error("{cnpj} is already pending")]
    AlreadyPending { cnpj: String },

    /// A CNPJ was submitted after it had already completed.
    #[error("{cnpj} is already done")]
    AlreadyDone { cnpj: String },

    /// A durable-store operation failed.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A provider HTTP call failed outside the classified outcome contract.
    #[error("provider transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Configuration could not be parsed.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A free-form message, for call sites that don't warrant their own
    /// variant.
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    /// Wraps an arbitrary error as a store failure.
    pub fn store<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(source))
    }

    /// Wraps an arbitrary error as a transport failure.
    pub fn transport<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(source))
    }

    /// Builds a free-form message error.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    /// Returns `true` if this is [`Error::InvalidCnpj`].
    pub fn is_invalid_cnpj(&self) -> bool {
        matches!(self, Self::InvalidCnpj { .. })
    }

    /// Returns `true` if this is [`Error::NoProviderAvailable`].
    pub fn is_no_provider_available(&self) -> bool {
        matches!(self, Self::NoProviderAvailable { .. })
    }

    /// Returns `true` if this is [`Error::AlreadyPending`] or
    /// [`Error::AlreadyDone`].
    pub fn is_duplicate_submission(&self) -> bool {
        matches!(self, Self::AlreadyPending { .. } | Self::AlreadyDone { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
