//! The process-wide facade over the store and job queue.
//!
//! The public method surface (`submit`/`status`/`restart`/
//! `cleanup_duplicates`) is a thin, transport-agnostic API any front end
//! (here, the CLI) can drive.

use std::sync::Arc;

use cnpj_core::Result;
use cnpj_queue::JobQueue;
use cnpj_store::{EnqueueOutcome, JobSummary, PersistentStore, StatusCounts};

const DEFAULT_RECENT_LIMIT: i64 = 100;

/// Per-CNPJ acknowledgement returned by [`Supervisor::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitAck {
    Queued,
    AlreadyPending,
    AlreadyDone,
    Invalid,
}

/// A point-in-time view of queue health.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub counts: StatusCounts,
    pub recent: Vec<JobSummary>,
}

/// Result of [`Supervisor::restart_queue`].
#[derive(Debug, Clone, Copy)]
pub struct RestartOutcome {
    pub restarted: bool,
    pub loaded_count: usize,
}

/// Result of [`Supervisor::cleanup_duplicates`].
#[derive(Debug, Clone, Copy)]
pub struct CleanupOutcome {
    pub removed_job_records: u64,
    pub removed_company_records: u64,
}

pub struct Supervisor {
    store: Arc<dyn PersistentStore>,
    queue: Arc<JobQueue>,
}

impl Supervisor {
    /// Wires a supervisor over an already-constructed store and queue.
    /// Start order (store before limiter before queue) is the caller's
    /// responsibility at composition time — by the time a `Supervisor`
    /// exists, the store is open and the queue holds a router backed by a
    /// live rate limiter.
    pub fn new(store: Arc<dyn PersistentStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Starts the queue, loading pending jobs and priming the reaper.
    pub async fn start(&self) -> Result<RestartOutcome> {
        let loaded_count = self.queue.start().await?;
        Ok(RestartOutcome {
            restarted: true,
            loaded_count,
        })
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    /// Submits a batch of CNPJs, canonicalizing and enqueueing each
    /// independently so one invalid entry doesn't fail the whole batch.
    pub async fn submit(&self, cnpjs: &[String]) -> Vec<(String, SubmitAck)> {
        let mut acks = Vec::with_capacity(cnpjs.len());
        for raw in cnpjs {
            let ack = match self.queue.enqueue(raw).await {
                Ok(EnqueueOutcome::Queued) => SubmitAck::Queued,
                Ok(EnqueueOutcome::AlreadyPending) => SubmitAck::AlreadyPending,
                Ok(EnqueueOutcome::AlreadyDone) => SubmitAck::AlreadyDone,
                Err(_) => SubmitAck::Invalid,
            };
            acks.push((raw.clone(), ack));
        }
        acks
    }

    pub async fn status_snapshot(&self) -> Result<StatusSnapshot> {
        let counts = self.store.count_by_status().await?;
        let recent = self.store.recent(DEFAULT_RECENT_LIMIT).await?;
        Ok(StatusSnapshot { counts, recent })
    }

    /// Idempotent: ensures the queue is running and forces an immediate
    /// refill from the store.
    pub async fn restart_queue(&self) -> Result<RestartOutcome> {
        let loaded_count = self.queue.start().await?;
        Ok(RestartOutcome {
            restarted: true,
            loaded_count,
        })
    }

    pub async fn cleanup_duplicates(&self) -> Result<CleanupOutcome> {
        let (removed_job_records, removed_company_records) = self.store.dedupe_duplicates().await?;
        Ok(CleanupOutcome {
            removed_job_records,
            removed_company_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnpj_providers::StubProviderClient;
    use cnpj_queue::JobQueueConfig;
    use cnpj_ratelimiter::{AdaptiveRateLimiter, ProviderSpec};
    use cnpj_router::ProviderRouter;
    use cnpj_store::SqliteStore;

    async fn make_supervisor() -> Supervisor {
        let store = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let limiter = Arc::new(AdaptiveRateLimiter::new(vec![ProviderSpec::new("acme", 60, true)]));
        let stub: Arc<dyn cnpj_providers::ProviderClient> = Arc::new(StubProviderClient::new("acme"));
        let router = Arc::new(ProviderRouter::new(limiter, vec![stub]));
        let store_dyn: Arc<dyn PersistentStore> = store.clone();
        let queue = JobQueue::new(store_dyn.clone(), router, JobQueueConfig::default());
        Supervisor::new(store_dyn, queue)
    }

    #[tokio::test]
    async fn submit_rejects_invalid_cnpjs_without_failing_the_batch() {
        let supervisor = make_supervisor().await;
        let acks = supervisor
            .submit(&["11222333000181".to_string(), "bad".to_string()])
            .await;
        assert_eq!(acks[0].1, SubmitAck::Queued);
        assert_eq!(acks[1].1, SubmitAck::Invalid);
    }

    #[tokio::test]
    async fn duplicate_submit_reports_already_pending() {
        let supervisor = make_supervisor().await;
        let cnpj = "11222333000181".to_string();
        supervisor.submit(&[cnpj.clone()]).await;
        let acks = supervisor.submit(&[cnpj]).await;
        assert_eq!(acks[0].1, SubmitAck::AlreadyPending);
    }

    #[tokio::test]
    async fn status_snapshot_reflects_submitted_jobs() {
        let supervisor = make_supervisor().await;
        supervisor.submit(&["11222333000181".to_string()]).await;
        let snapshot = supervisor.status_snapshot().await.unwrap();
        assert_eq!(snapshot.counts.total(), 1);
    }

    #[tokio::test]
    async fn cleanup_duplicates_is_a_no_op_on_a_clean_store() {
        let supervisor = make_supervisor().await;
        let outcome = supervisor.cleanup_duplicates().await.unwrap();
        assert_eq!(outcome.removed_company_records, 0);
    }
}
