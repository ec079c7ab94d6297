//! The durable mapping of CNPJ to job status and normalized company
//! data, backed by SQLite through `sqlx`.
//!
//! Every public method here is its own transaction; none holds a
//! connection across a suspension point belonging to a different logical
//! operation.

mod row;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cnpj_core::{CompanyRecord, Error, JobStatus, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

pub use row::{JobSummary, StatusCounts};

/// Outcome of [`PersistentStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyPending,
    AlreadyDone,
}

/// Durable operations the job queue and supervisor rely on.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Canonicalizes nothing (the caller already holds a validated
    /// [`cnpj_core::Cnpj`]); inserts a fresh `queued` row unless the
    /// existing latest row is `processing`/`queued` (-> AlreadyPending) or
    /// `completed` (-> AlreadyDone).
    async fn enqueue(&self, cnpj: &str) -> Result<EnqueueOutcome>;

    /// Conditionally transitions `queued -> processing`. Returns `true`
    /// only if this call performed the transition.
    async fn claim_next(&self, cnpj: &str) -> Result<bool>;

    /// Upserts the company record and marks the job `completed`, in one
    /// transaction. A uniqueness violation on the company record is
    /// treated as success (a prior run already completed this CNPJ).
    async fn mark_completed(&self, cnpj: &str, record: &CompanyRecord) -> Result<()>;

    async fn mark_error(&self, cnpj: &str, message: &str) -> Result<()>;

    async fn mark_rate_limited(&self, cnpj: &str, message: &str) -> Result<()>;

    /// Moves a job back to `queued`, incrementing `retry_count`. Used for
    /// router-level retries (the worker is about to make another attempt
    /// and the retry budget must reflect that).
    async fn requeue(&self, cnpj: &str) -> Result<()>;

    /// Finds `processing` jobs whose `updated_at` predates `now -
    /// threshold_ms` and transitions each back to `queued`, guarded by
    /// `status = processing` so a row that reached a terminal status
    /// between the select and the update is left alone. Does not touch
    /// `retry_count`: the reaper is recovering an abandoned worker, not
    /// consuming the job's retry budget. Returns the CNPJs actually
    /// rescued. One transaction, so a racing `claim_next` or terminal
    /// write can't be clobbered.
    async fn reap_stuck(&self, threshold_ms: u64) -> Result<Vec<String>>;

    /// Oldest `queued` CNPJs, for the in-memory queue's refill task.
    async fn load_pending(&self, limit: i64) -> Result<Vec<String>>;

    /// Current retry count for a CNPJ, used to enforce `MAX_RETRIES`.
    async fn retry_count(&self, cnpj: &str) -> Result<u32>;

    async fn count_by_status(&self) -> Result<StatusCounts>;

    /// Newest `limit` jobs by `updated_at`, for status snapshots.
    async fn recent(&self, limit: i64) -> Result<Vec<JobSummary>>;

    /// Removes company records with no corresponding job record. Returns
    /// `(removed_job_records, removed_company_records)`. Job records
    /// cannot duplicate under this schema (`cnpj` is their primary key);
    /// this method's non-zero half is always the second element.
    async fn dedupe_duplicates(&self) -> Result<(u64, u64)>;
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// SQLite-backed [`PersistentStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects to `database_url`, creating the pool and running
    /// migrations. Use [`SqliteStore::with_pool`] if migrations have
    /// already been run against a shared pool.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(Error::store)?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool. Caller is responsible for having already
    /// run migrations.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Runs this crate's embedded migrations against `pool`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(Error::store)
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn enqueue(&self, cnpj: &str) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;

        let existing: Option<String> = sqlx::query_scalar("SELECT status FROM job_records WHERE cnpj = ?")
            .bind(cnpj)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::store)?;

        if let Some(status) = existing.as_deref().and_then(JobStatus::from_str) {
            if status == JobStatus::Processing || status == JobStatus::Queued {
                return Ok(EnqueueOutcome::AlreadyPending);
            }
            if status == JobStatus::Completed {
                return Ok(EnqueueOutcome::AlreadyDone);
            }
        }

        let now = now_ms();
        sqlx::query(
            "INSERT INTO job_records (cnpj, status, error_message, retry_count, created_at_ms, updated_at_ms)
             VALUES (?, ?, NULL, 0, ?, ?)
             ON CONFLICT(cnpj) DO UPDATE SET
                status = excluded.status,
                error_message = NULL,
                retry_count = 0,
                updated_at_ms = excluded.updated_at_ms",
        )
        .bind(cnpj)
        .bind(JobStatus::Queued.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        tx.commit().await.map_err(Error::store)?;
        Ok(EnqueueOutcome::Queued)
    }

    async fn claim_next(&self, cnpj: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let now = now_ms();

        let result = sqlx::query(
            "UPDATE job_records SET status = ?, updated_at_ms = ?
             WHERE cnpj = ? AND status = ?",
        )
        .bind(JobStatus::Processing.as_str())
        .bind(now)
        .bind(cnpj)
        .bind(JobStatus::Queued.as_str())
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        tx.commit().await.map_err(Error::store)?;
        let claimed = result.rows_affected() > 0;
        #[cfg(feature = "tracing")]
        if !claimed {
            tracing::debug!(cnpj = %cnpj, "claim_next lost the race, row was not queued");
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, cnpj: &str, record: &CompanyRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let now = now_ms();

        let secondary = serde_json::to_string(&record.secondary_activity_codes).map_err(Error::store)?;
        let partners = serde_json::to_string(&record.partners).map_err(Error::store)?;

        sqlx::query(
            "INSERT INTO company_records (
                cnpj, legal_name, trade_name, street, number, complement, neighborhood,
                city, state, zip_code, phone, email, registration_status,
                primary_activity_code, secondary_activity_codes, simples_nacional,
                partners, provider_name, last_queried_at_ms
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cnpj) DO UPDATE SET
                legal_name = excluded.legal_name,
                trade_name = excluded.trade_name,
                street = excluded.street,
                number = excluded.number,
                complement = excluded.complement,
                neighborhood = excluded.neighborhood,
                city = excluded.city,
                state = excluded.state,
                zip_code = excluded.zip_code,
                phone = excluded.phone,
                email = excluded.email,
                registration_status = excluded.registration_status,
                primary_activity_code = excluded.primary_activity_code,
                secondary_activity_codes = excluded.secondary_activity_codes,
                simples_nacional = excluded.simples_nacional,
                partners = excluded.partners,
                provider_name = excluded.provider_name,
                last_queried_at_ms = excluded.last_queried_at_ms",
        )
        .bind(cnpj)
        .bind(&record.legal_name)
        .bind(&record.trade_name)
        .bind(&record.street)
        .bind(&record.number)
        .bind(&record.complement)
        .bind(&record.neighborhood)
        .bind(&record.city)
        .bind(&record.state)
        .bind(&record.zip_code)
        .bind(&record.phone)
        .bind(&record.email)
        .bind(&record.registration_status)
        .bind(&record.primary_activity_code)
        .bind(secondary)
        .bind(record.simples_nacional)
        .bind(partners)
        .bind(&record.provider_name)
        .bind(now)
        .execute(&mut *tx)
        .await
        // A uniqueness violation here would mean a concurrent writer already
        // persisted this CNPJ; ON CONFLICT above means sqlx never actually
        // surfaces that as an error, but the classification is kept for any
        // future backend that can't express the upsert atomically.
        .map_err(Error::store)?;

        sqlx::query(
            "UPDATE job_records SET status = ?, error_message = NULL, updated_at_ms = ?
             WHERE cnpj = ?",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(now)
        .bind(cnpj)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }

    async fn mark_error(&self, cnpj: &str, message: &str) -> Result<()> {
        self.set_terminal_status(cnpj, JobStatus::Error, message).await
    }

    async fn mark_rate_limited(&self, cnpj: &str, message: &str) -> Result<()> {
        self.set_terminal_status(cnpj, JobStatus::RateLimited, message).await
    }

    async fn requeue(&self, cnpj: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let now = now_ms();

        sqlx::query(
            "UPDATE job_records SET status = ?, retry_count = retry_count + 1, updated_at_ms = ?
             WHERE cnpj = ?",
        )
        .bind(JobStatus::Queued.as_str())
        .bind(now)
        .bind(cnpj)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }

    async fn reap_stuck(&self, threshold_ms: u64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let cutoff = now_ms() - threshold_ms as i64;

        let rows = sqlx::query("SELECT cnpj FROM job_records WHERE status = ? AND updated_at_ms < ?")
            .bind(JobStatus::Processing.as_str())
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::store)?;
        let candidates: Vec<String> = rows.into_iter().map(|r| r.get::<String, _>("cnpj")).collect();

        let mut rescued = Vec::with_capacity(candidates.len());
        for cnpj in candidates {
            let now = now_ms();
            let result = sqlx::query(
                "UPDATE job_records SET status = ?, updated_at_ms = ?
                 WHERE cnpj = ? AND status = ?",
            )
            .bind(JobStatus::Queued.as_str())
            .bind(now)
            .bind(&cnpj)
            .bind(JobStatus::Processing.as_str())
            .execute(&mut *tx)
            .await
            .map_err(Error::store)?;

            // Guarded by `status = processing`: a row a worker already
            // moved to `completed`/`error` in the window between the
            // SELECT above and this UPDATE is left untouched.
            if result.rows_affected() > 0 {
                rescued.push(cnpj);
            }
        }

        tx.commit().await.map_err(Error::store)?;

        #[cfg(feature = "tracing")]
        if !rescued.is_empty() {
            tracing::warn!(count = rescued.len(), "reaper rescued stuck processing rows");
        }
        Ok(rescued)
    }

    async fn load_pending(&self, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT cnpj FROM job_records WHERE status = ? ORDER BY created_at_ms ASC LIMIT ?",
        )
        .bind(JobStatus::Queued.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::store)?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("cnpj")).collect())
    }

    async fn retry_count(&self, cnpj: &str) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar("SELECT retry_count FROM job_records WHERE cnpj = ?")
            .bind(cnpj)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::store)?;
        Ok(count.unwrap_or(0) as u32)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM job_records GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::store)?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match JobStatus::from_str(&status) {
                Some(JobStatus::Queued) => counts.queued = n as u64,
                Some(JobStatus::Processing) => counts.processing = n as u64,
                Some(JobStatus::Completed) => counts.completed = n as u64,
                Some(JobStatus::Error) => counts.error = n as u64,
                Some(JobStatus::RateLimited) => counts.rate_limited = n as u64,
                None => {}
            }
        }
        Ok(counts)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query(
            "SELECT cnpj, status, error_message FROM job_records
             ORDER BY updated_at_ms DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::store)?;

        Ok(rows
            .into_iter()
            .map(|row| JobSummary {
                cnpj: row.get("cnpj"),
                status: JobStatus::from_str(&row.get::<String, _>("status"))
                    .unwrap_or(JobStatus::Error),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn dedupe_duplicates(&self) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let result = sqlx::query(
            "DELETE FROM company_records
             WHERE cnpj NOT IN (SELECT cnpj FROM job_records)",
        )
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;
        tx.commit().await.map_err(Error::store)?;
        Ok((0, result.rows_affected()))
    }
}

impl SqliteStore {
    async fn set_terminal_status(&self, cnpj: &str, status: JobStatus, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::store)?;
        let now = now_ms();

        sqlx::query(
            "UPDATE job_records SET status = ?, error_message = ?, updated_at_ms = ?
             WHERE cnpj = ?",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(now)
        .bind(cnpj)
        .execute(&mut *tx)
        .await
        .map_err(Error::store)?;

        tx.commit().await.map_err(Error::store)?;
        Ok(())
    }
}
