//! Helpers for testing queries, caches and clients.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most timing sensitive tests should run on a paused clock, with
//!    `#[tokio::test(start_paused = true)]`. The [`Backend`] sleeps through [`tokio::time`], so its
//!    latency advances instantly on a paused runtime.
//!
//!  - Hold on to [`EventLog`] and [`StateLog`] for the entire test. Dropping them unsubscribes.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use querycache::{
    CacheEvent, CacheSubscription, ObserverHandle, Query, QueryCache, QueryError, QueryKey,
    QueryState, StateSummary, Subscription,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `querycache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("querycache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// What a [`Backend`] producer returns.
pub type ProducerFuture<T> = BoxFuture<'static, Result<T, QueryError>>;

/// A fake remote service standing in for a producer.
///
/// It answers every call with its current value after its latency elapsed, unless a scripted
/// response was queued with [`respond`](Self::respond). Every call is counted per key.
pub struct Backend<T> {
    inner: Arc<BackendInner<T>>,
}

struct BackendInner<T> {
    value: Mutex<T>,
    latency: Mutex<Duration>,
    scripted: Mutex<VecDeque<Result<T, QueryError>>>,
    hits: Mutex<BTreeMap<String, usize>>,
}

impl<T> Clone for Backend<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Backend<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                value: Mutex::new(value),
                latency: Mutex::new(Duration::ZERO),
                scripted: Mutex::new(VecDeque::new()),
                hits: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Sets how long each call takes.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = latency;
        self
    }

    /// Changes what unscripted calls return from now on.
    pub fn set_value(&self, value: T) {
        *self.inner.value.lock() = value;
    }

    /// Queues a response for the next call. Queued responses are used up in order.
    pub fn respond(&self, response: Result<T, QueryError>) {
        self.inner.scripted.lock().push_back(response);
    }

    /// Queues `count` failures with `error`.
    pub fn fail_times(&self, count: usize, error: QueryError) {
        let mut scripted = self.inner.scripted.lock();
        for _ in 0..count {
            scripted.push_back(Err(error.clone()));
        }
    }

    /// The producer to hand to a query.
    pub fn producer(&self) -> impl Fn(QueryKey) -> ProducerFuture<T> + Send + Sync + use<T> {
        let backend = self.clone();
        move |key| backend.call(key)
    }

    fn call(&self, key: QueryKey) -> ProducerFuture<T> {
        *self.inner.hits.lock().entry(key.to_string()).or_default() += 1;

        let response = self
            .inner
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(self.inner.value.lock().clone()));
        let latency = *self.inner.latency.lock();

        async move {
            tokio::time::sleep(latency).await;
            response
        }
        .boxed()
    }

    /// Returns the number of calls since the last check, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = mem::take(&mut *self.inner.hits.lock());
        map.into_values().sum()
    }

    /// Returns the calls per key since the last check, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = mem::take(&mut *self.inner.hits.lock());
        map.into_iter().collect()
    }
}

/// Records the events of a [`QueryCache`].
pub struct EventLog {
    events: Arc<Mutex<Vec<CacheEvent>>>,
    _subscription: CacheSubscription,
}

impl EventLog {
    pub fn new(cache: &QueryCache) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = cache.subscribe({
            let events = events.clone();
            move |event: &CacheEvent| events.lock().push(event.clone())
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    /// Returns the events since the last call.
    pub fn take(&self) -> Vec<CacheEvent> {
        mem::take(&mut *self.events.lock())
    }

    /// Returns the events since the last call, leaving out [`CacheEvent::Updated`].
    pub fn take_structural(&self) -> Vec<CacheEvent> {
        self.take()
            .into_iter()
            .filter(|event| !matches!(event, CacheEvent::Updated(_)))
            .collect()
    }
}

enum StateGuard {
    Passive(#[allow(dead_code)] Subscription),
    Active(#[allow(dead_code)] ObserverHandle),
}

/// Records the state transitions of a [`Query`] as seen by an observer.
pub struct StateLog {
    states: Arc<Mutex<Vec<StateSummary>>>,
    guard: Option<StateGuard>,
}

impl StateLog {
    /// Subscribes without marking the query active.
    pub fn subscribe<T>(query: &Query<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let states = Arc::new(Mutex::new(Vec::new()));
        let subscription = query.subscribe(recorder(&states));
        Self {
            states,
            guard: Some(StateGuard::Passive(subscription)),
        }
    }

    /// Subscribes and marks the query active, like a mounted consumer.
    pub fn observe<T>(query: &Query<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let states = Arc::new(Mutex::new(Vec::new()));
        let handle = query.observe(recorder(&states));
        Self {
            states,
            guard: Some(StateGuard::Active(handle)),
        }
    }

    /// Returns the states since the last call.
    pub fn take(&self) -> Vec<StateSummary> {
        mem::take(&mut *self.states.lock())
    }

    /// Unsubscribes, keeping the recorded states.
    pub fn stop(&mut self) {
        self.guard = None;
    }
}

fn recorder<T>(
    states: &Arc<Mutex<Vec<StateSummary>>>,
) -> impl Fn(&QueryState<T>) + Send + Sync + 'static + use<T>
where
    T: Clone + Send + Sync + 'static,
{
    let states = states.clone();
    move |state: &QueryState<T>| states.lock().push(state.summary())
}
