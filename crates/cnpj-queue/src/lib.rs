//! The in-memory work queue, its worker dispatch, pacing, refill, and
//! stuck-job reaper.
//!
//! The dispatch loop claims a job *before* spawning its worker task, so two
//! workers can never pick up the same row, and bounds in-flight work with a
//! `tokio::sync::Semaphore`.

pub mod config;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use cnpj_core::{Cnpj, Error, EventListener, EventListeners, LifecycleEvent, Result};
use cnpj_router::{FinalError, ProviderRouter};
use cnpj_store::{EnqueueOutcome, PersistentStore};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub use config::JobQueueConfig;
pub use state::QueueState;

const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct JobQueue {
    store: Arc<dyn PersistentStore>,
    router: Arc<ProviderRouter>,
    config: JobQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    next_start: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    events: StdMutex<EventListeners<LifecycleEvent>>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        router: Arc<ProviderRouter>,
        config: JobQueueConfig,
    ) -> Arc<Self> {
        let max_concurrent = config.max_concurrent;
        Arc::new(Self {
            store,
            router,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            running: AtomicBool::new(false),
            next_start: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            events: StdMutex::new(EventListeners::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers a listener notified of [`LifecycleEvent::JobStatusChanged`]
    /// and [`LifecycleEvent::ReaperRescued`] events.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: EventListener<LifecycleEvent> + 'static,
    {
        self.events.lock().unwrap().add(listener);
    }

    fn emit(&self, event: LifecycleEvent) {
        self.events.lock().unwrap().emit(&event);
    }

    /// Starts the dispatcher, refill, and reaper tasks. Per the
    /// supervisor's boot contract, first promotes any already-stuck
    /// `processing` rows back to `queued` (a prior process may have died
    /// mid-attempt), then loads pending `queued` rows, before admitting
    /// any of it to the dispatcher. Returns how many rows were loaded or
    /// rescued. Idempotent: calling `start` again while running just
    /// triggers another reap-and-refill pass and returns that count.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        let rescued = self.reap_once().await;
        let loaded = self.refill_once().await?;
        let total = rescued + loaded;

        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(total);
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.clone().dispatch_loop()));
        tasks.push(tokio::spawn(self.clone().refill_loop()));
        tasks.push(tokio::spawn(self.clone().reaper_loop()));

        Ok(total)
    }

    /// Stops admitting new work and aborts the background tasks.
    /// In-flight route calls are not cancelled; they run to completion and
    /// will be healed by the reaper on next boot if interrupted.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Canonicalizes and enqueues `raw_cnpj`. Pushes to the in-memory
    /// queue immediately when the store accepts it as newly `queued`.
    pub async fn enqueue(&self, raw_cnpj: &str) -> Result<EnqueueOutcome> {
        let cnpj = Cnpj::parse(raw_cnpj)?;
        let outcome = self.store.enqueue(cnpj.as_str()).await?;
        if outcome == EnqueueOutcome::Queued {
            self.push_and_notify(cnpj.as_str().to_string()).await;
        }
        Ok(outcome)
    }

    pub async fn in_memory_len(&self) -> usize {
        self.state.lock().await.len()
    }

    async fn push_and_notify(&self, cnpj: String) {
        let pushed = {
            let mut state = self.state.lock().await;
            state.push_if_absent(cnpj)
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Tops up the in-memory queue while `in_memory + in_flight` is below
    /// `2 * total_provider_limit`: the in-memory backlog plus what workers
    /// are already chewing on shouldn't outrun twice the combined
    /// per-minute provider capacity, or the queue just holds rows no
    /// provider can serve soon. Called on start and by the periodic refill
    /// task.
    async fn refill_once(&self) -> Result<usize> {
        let in_memory = self.state.lock().await.len();
        let in_flight = self.config.max_concurrent - self.semaphore.available_permits();
        let budget = 2 * self.config.total_provider_limit as usize;
        if in_memory + in_flight >= budget {
            return Ok(0);
        }

        let limit = (budget - (in_memory + in_flight)) as i64;
        let pending = self.store.load_pending(limit).await?;
        let mut loaded = 0;
        for cnpj in pending {
            let pushed = {
                let mut state = self.state.lock().await;
                state.push_if_absent(cnpj)
            };
            if pushed {
                loaded += 1;
            }
        }
        if loaded > 0 {
            self.notify.notify_waiters();
        }
        Ok(loaded)
    }

    async fn next_cnpj(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(cnpj) = state.pop_front() {
                    return Some(cnpj);
                }
            }
            if !self.is_running() {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep(NOTIFY_POLL_INTERVAL) => {}
            }
        }
    }

    /// Enforces the global `MIN_INTERVAL` spacing between successive
    /// `route` starts.
    async fn pace(&self) {
        let wait = {
            let mut next_start = self.next_start.lock().await;
            let now = Instant::now();
            let start_at = (*next_start).max(now);
            *next_start = start_at + self.config.min_interval;
            start_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        while self.is_running() {
            let Some(cnpj) = self.next_cnpj().await else {
                break;
            };

            let claimed = self.store.claim_next(&cnpj).await.unwrap_or(false);
            if !claimed {
                // Already processing (another claim raced us) or no longer
                // queued; drop it silently.
                continue;
            }

            self.pace().await;

            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.process_claimed(&cnpj).await;
                drop(permit);
            });
        }
    }

    async fn process_claimed(&self, cnpj: &str) {
        let Ok(parsed) = Cnpj::parse(cnpj) else {
            let _ = self.store.mark_error(cnpj, "stored CNPJ failed re-validation").await;
            self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "error"));
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::info!(cnpj = %cnpj, "dispatching job");

        match self.router.route(&parsed).await {
            Ok(record) => {
                let _ = self.store.mark_completed(cnpj, &record).await;
                self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "completed"));
            }
            Err(FinalError::NotFound) => {
                let _ = self.store.mark_error(cnpj, "CNPJ not found").await;
                self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "error"));
            }
            Err(FinalError::Invalid(reason)) => {
                let _ = self.store.mark_error(cnpj, &reason).await;
                self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "error"));
            }
            Err(FinalError::NoProviderAvailable) => {
                self.retry_or_give_up(cnpj, "no provider available").await;
            }
            Err(FinalError::AllProvidersFailed { last_reason }) => {
                self.retry_or_give_up(cnpj, &last_reason).await;
            }
        }
    }

    async fn retry_or_give_up(&self, cnpj: &str, reason: &str) {
        let retry_count = self.store.retry_count(cnpj).await.unwrap_or(0);
        if retry_count < self.config.max_retries {
            let backoff_secs = 2u64.saturating_pow(retry_count + 1).min(8);
            sleep(Duration::from_secs(backoff_secs)).await;
            if self.store.requeue(cnpj).await.is_ok() {
                self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "queued"));
                self.push_and_notify(cnpj.to_string()).await;
            }
        } else {
            let _ = self.store.mark_rate_limited(cnpj, reason).await;
            self.emit(LifecycleEvent::job_status_changed(cnpj.to_string(), "rate_limited"));
        }
    }

    async fn refill_loop(self: Arc<Self>) {
        while self.is_running() {
            sleep(self.config.refill_interval).await;
            if !self.is_running() {
                break;
            }
            let _ = self.refill_once().await;
        }
    }

    async fn reaper_loop(self: Arc<Self>) {
        while self.is_running() {
            sleep(self.config.reaper_interval).await;
            if !self.is_running() {
                break;
            }
            self.reap_once().await;
        }
    }

    /// Promotes long-stuck `processing` rows back to `queued`. The store's
    /// `reap_stuck` does the select-and-guarded-update in one transaction,
    /// so a row a worker completes in the meantime is left alone and its
    /// `retry_count` is untouched. Returns how many rows were rescued.
    async fn reap_once(&self) -> usize {
        let threshold_ms = self.config.stuck_threshold.as_millis() as u64;
        let Ok(rescued) = self.store.reap_stuck(threshold_ms).await else {
            return 0;
        };
        let count = rescued.len();
        for cnpj in rescued {
            #[cfg(feature = "tracing")]
            tracing::warn!(cnpj = %cnpj, "reaper recovering stuck job");
            self.emit(LifecycleEvent::reaper_rescued(cnpj.clone()));
            self.push_and_notify(cnpj).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnpj_providers::{ProviderClient, ProviderOutcome, StubProviderClient};
    use cnpj_ratelimiter::{AdaptiveRateLimiter, ProviderSpec};
    use cnpj_store::SqliteStore;
    use std::sync::Arc as StdArc;

    async fn make_queue(
        stub: StdArc<StubProviderClient>,
        config: JobQueueConfig,
    ) -> (Arc<JobQueue>, StdArc<SqliteStore>) {
        let store = StdArc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        let limiter = StdArc::new(AdaptiveRateLimiter::new(vec![ProviderSpec::new(
            stub.name().to_string(),
            600,
            true,
        )]));
        let router = StdArc::new(ProviderRouter::new(limiter, vec![stub]));
        let store_dyn: Arc<dyn PersistentStore> = store.clone();
        (JobQueue::new(store_dyn, router, config), store)
    }

    #[tokio::test]
    async fn enqueue_pushes_into_memory_and_completes_via_dispatch() {
        let stub = StdArc::new(StubProviderClient::new("acme"));
        let cnpj = "11222333000181";
        stub.script(
            cnpj,
            vec![ProviderOutcome::Ok(cnpj_core::CompanyRecord {
                cnpj: cnpj.into(),
                ..Default::default()
            })],
        );

        let mut config = JobQueueConfig::default();
        config.min_interval = Duration::from_millis(1);
        let (queue, store) = make_queue(stub, config).await;

        queue.start().await.unwrap();
        queue.enqueue(cnpj).await.unwrap();

        for _ in 0..50 {
            let counts = store.count_by_status().await.unwrap();
            if counts.completed == 1 {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.completed, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_reported_as_already_pending() {
        let stub = StdArc::new(StubProviderClient::new("acme"));
        let (queue, _store) = make_queue(stub, JobQueueConfig::default()).await;

        let cnpj = "11222333000181";
        assert_eq!(queue.enqueue(cnpj).await.unwrap(), EnqueueOutcome::Queued);
        assert_eq!(
            queue.enqueue(cnpj).await.unwrap(),
            EnqueueOutcome::AlreadyPending
        );
    }

    #[tokio::test]
    async fn invalid_cnpj_is_rejected_before_touching_the_store() {
        let stub = StdArc::new(StubProviderClient::new("acme"));
        let (queue, _store) = make_queue(stub, JobQueueConfig::default()).await;
        let result = queue.enqueue("not-a-cnpj").await;
        assert!(matches!(result, Err(Error::InvalidCnpj { .. })));
    }

    #[tokio::test]
    async fn start_reaps_stuck_rows_before_admitting_new_work() {
        let stub = StdArc::new(StubProviderClient::new("acme"));
        let mut config = JobQueueConfig::default();
        config.stuck_threshold = Duration::from_secs(0);
        let (queue, store) = make_queue(stub, config).await;

        let cnpj = "11222333000181";
        store.enqueue(cnpj).await.unwrap();
        assert!(store.claim_next(cnpj).await.unwrap());

        let loaded = queue.start().await.unwrap();
        assert_eq!(loaded, 1);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.queued, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn reaper_rescue_emits_a_lifecycle_event() {
        use cnpj_core::FnListener;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let stub = StdArc::new(StubProviderClient::new("acme"));
        let mut config = JobQueueConfig::default();
        config.stuck_threshold = Duration::from_secs(0);
        let (queue, store) = make_queue(stub, config).await;

        let cnpj = "11222333000181";
        store.enqueue(cnpj).await.unwrap();
        assert!(store.claim_next(cnpj).await.unwrap());

        let seen = StdArc::new(AtomicUsize::new(0));
        let seen_clone = StdArc::clone(&seen);
        queue.add_listener(FnListener::new(move |event: &LifecycleEvent| {
            if event.event_type() == "reaper_rescued" {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        queue.reap_once().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refill_respects_the_in_memory_plus_in_flight_budget() {
        let stub = StdArc::new(StubProviderClient::new("acme"));
        let mut config = JobQueueConfig::default();
        config.total_provider_limit = 1;
        let (queue, store) = make_queue(stub, config).await;

        store.enqueue("11222333000181").await.unwrap();
        store.enqueue("11444777000161").await.unwrap();

        // Budget is 2 * total_provider_limit = 2, already saturated by an
        // in-memory row before the refill runs.
        queue.push_and_notify("11222333000181".to_string()).await;
        queue.push_and_notify("11444777000161".to_string()).await;
        let loaded = queue.refill_once().await.unwrap();
        assert_eq!(loaded, 0);
    }
}
