//! Read-model types returned by [`crate::PersistentStore`] status queries.

use cnpj_core::JobStatus;

/// Per-status job counts, as surfaced by `Supervisor::status_snapshot`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub error: u64,
    pub rate_limited: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.error + self.rate_limited
    }
}

/// One row of the "recent jobs" list in a status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub cnpj: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
}
