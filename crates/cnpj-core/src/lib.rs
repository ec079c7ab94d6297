//! Shared domain types for the CNPJ enrichment queue.
//!
//! This crate has no knowledge of HTTP, SQL, or scheduling — it only defines
//! the vocabulary every other `cnpj-*` crate shares: the canonical `Cnpj`
//! identifier, job/provider outcome enums, the normalized `CompanyRecord`,
//! the crate-spanning error type, and an observability event system.

pub mod cnpj;
pub mod error;
pub mod events;
pub mod record;

pub use cnpj::Cnpj;
pub use error::{Error, Result};
pub use events::{EventListener, EventListeners, FnListener, LifecycleEvent, LifecycleEventKind, QueueEvent};
#[cfg(feature = "tracing")]
pub use events::TracingListener;
pub use record::{CompanyRecord, JobStatus, ProviderOutcome};
