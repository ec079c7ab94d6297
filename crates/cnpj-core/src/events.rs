//! Observability event system shared by the rate limiter and the job queue.
//!
//! The shape mirrors a classic listener-collection: a trait object per
//! event kind, a collection that never lets one panicking listener starve
//! the rest, and optional `tracing`/`metrics` instrumentation behind
//! feature flags. [`LifecycleEvent`] is the concrete event type both
//! `cnpj-ratelimiter` (provider cooldowns) and `cnpj-queue` (job status
//! transitions, reaper rescues) emit through their own `EventListeners`.

#[cfg(feature = "tracing")]
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A single observable occurrence inside the queue (provider selected,
/// job transitioned, reaper rescued a job, ...).
pub trait QueueEvent: Send + Sync + fmt::Debug {
    /// Short machine-readable kind, e.g. `"provider_cooldown"`.
    fn event_type(&self) -> &'static str;

    /// When the event occurred.
    fn timestamp(&self) -> Instant;
}

/// Receives [`QueueEvent`]s emitted by a component.
pub trait EventListener<E: QueueEvent>: Send + Sync {
    fn on_event(&self, event: &E);
}

type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// A collection of listeners for one event type.
#[derive(Clone)]
pub struct EventListeners<E: QueueEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: QueueEvent> EventListeners<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to every listener. A listener that panics is caught
    /// so the remaining listeners still run.
    pub fn emit(&self, event: &E) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if let Err(_panic_payload) = result {
                #[cfg(feature = "tracing")]
                log_listener_panic(index, event, _panic_payload.as_ref());

                #[cfg(feature = "metrics")]
                record_listener_panic_metric(event);

                #[cfg(not(feature = "tracing"))]
                let _ = index;

                #[cfg(not(any(feature = "tracing", feature = "metrics")))]
                let _ = _panic_payload;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: QueueEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A function-backed listener, for the common case of not needing a named
/// type.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: QueueEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

#[cfg(feature = "tracing")]
fn log_listener_panic<E: QueueEvent>(index: usize, event: &E, panic_payload: &(dyn Any + Send)) {
    let panic_message = panic_payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic_payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    tracing::warn!(
        listener_index = index,
        event_type = event.event_type(),
        panic_message = %panic_message,
        "queue event listener panicked"
    );
}

#[cfg(feature = "metrics")]
fn record_listener_panic_metric<E: QueueEvent>(event: &E) {
    let event_type_label = event.event_type().to_string();
    metrics::counter!(
        "cnpj_queue_event_listener_panics_total",
        "event_type" => event_type_label
    )
    .increment(1);
}

/// The occurrences worth observing outside the component that produced
/// them, without a bespoke struct per kind.
#[derive(Debug, Clone)]
pub enum LifecycleEventKind {
    /// A provider was placed in cooldown after a rate-limit or transient
    /// failure signal.
    ProviderCooldown { provider: String, cooldown: Duration },
    /// A job's durable status changed.
    JobStatusChanged { cnpj: String, status: &'static str },
    /// The reaper moved an abandoned `processing` row back to `queued`.
    ReaperRescued { cnpj: String },
}

/// A concrete [`QueueEvent`] shared by `cnpj-ratelimiter` and `cnpj-queue`.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    kind: LifecycleEventKind,
    timestamp: Instant,
}

impl LifecycleEvent {
    pub fn provider_cooldown(provider: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            kind: LifecycleEventKind::ProviderCooldown {
                provider: provider.into(),
                cooldown,
            },
            timestamp: Instant::now(),
        }
    }

    pub fn job_status_changed(cnpj: impl Into<String>, status: &'static str) -> Self {
        Self {
            kind: LifecycleEventKind::JobStatusChanged {
                cnpj: cnpj.into(),
                status,
            },
            timestamp: Instant::now(),
        }
    }

    pub fn reaper_rescued(cnpj: impl Into<String>) -> Self {
        Self {
            kind: LifecycleEventKind::ReaperRescued { cnpj: cnpj.into() },
            timestamp: Instant::now(),
        }
    }

    pub fn kind(&self) -> &LifecycleEventKind {
        &self.kind
    }
}

impl QueueEvent for LifecycleEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            LifecycleEventKind::ProviderCooldown { .. } => "provider_cooldown",
            LifecycleEventKind::JobStatusChanged { .. } => "job_status_changed",
            LifecycleEventKind::ReaperRescued { .. } => "reaper_rescued",
        }
    }

    fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// Forwards every event it receives to `tracing`, at debug level. Useful
/// as a default listener so callers get observability without writing
/// their own [`EventListener`].
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

#[cfg(feature = "tracing")]
impl<E: QueueEvent> EventListener<E> for TracingListener {
    fn on_event(&self, event: &E) {
        tracing::debug!(event_type = event.event_type(), "queue event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestEvent {
        timestamp: Instant,
    }

    impl QueueEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            "test"
        }

        fn timestamp(&self) -> Instant {
            self.timestamp
        }
    }

    #[test]
    fn emits_to_every_listener() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(move |_: &TestEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let event = TestEvent {
            timestamp: Instant::now(),
        };
        listeners.emit(&event);
        listeners.emit(&event);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_listener_does_not_stop_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|_: &TestEvent| panic!("boom")));
        listeners.add(FnListener::new(move |_: &TestEvent| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let event = TestEvent {
            timestamp: Instant::now(),
        };
        listeners.emit(&event);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lifecycle_event_reports_the_right_event_type_per_kind() {
        let cooldown = LifecycleEvent::provider_cooldown("acme", Duration::from_secs(60));
        assert_eq!(cooldown.event_type(), "provider_cooldown");

        let status = LifecycleEvent::job_status_changed("11222333000181", "completed");
        assert_eq!(status.event_type(), "job_status_changed");

        let rescued = LifecycleEvent::reaper_rescued("11222333000181");
        assert_eq!(rescued.event_type(), "reaper_rescued");
    }

    #[test]
    fn lifecycle_events_reach_listeners_through_event_listeners() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(move |_: &LifecycleEvent| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&LifecycleEvent::reaper_rescued("11222333000181"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
