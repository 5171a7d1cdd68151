use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::{Mutex, MutexGuard};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::cache::{CacheInner, QueryCache, QueryHash, is_collectable};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::observer::{ObserverHandle, ObserverId, QueryObserver, Subscription};
use crate::options::DefaultOptions;
use crate::reporting::{ErrorReporter, SentryReporter};
use crate::state::{QueryState, StateSummary};
use crate::utils::CallOnDrop;

/// The type-erased producer of a query's data.
pub type QueryFn<T> =
    Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Wraps an async function into a [`QueryFn`].
///
/// Any error convertible into a [`QueryError`] works, including [`anyhow::Error`], which is
/// classified through [`QueryError::classify`].
pub fn query_fn<T, F, Fut, E>(producer: F) -> QueryFn<T>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<QueryError> + 'static,
{
    Arc::new(move |key| producer(key).map_err(Into::into).boxed())
}

type FetchResult<T> = Result<T, QueryError>;
type FetchChannel<T> = Shared<oneshot::Receiver<FetchResult<T>>>;

/// Things a query needs from the client that owns it.
#[derive(Clone)]
pub(crate) struct QueryContext {
    pub online: watch::Receiver<bool>,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl Default for QueryContext {
    fn default() -> Self {
        // the sender is gone, so this stays online forever
        let (_, online) = watch::channel(true);
        Self {
            online,
            reporter: Arc::new(SentryReporter),
        }
    }
}

/// One cached resource: its key, its state, and the machinery to fetch it.
///
/// A `Query` is a cheap handle; clones refer to the same query. At most one fetch runs per query
/// at any time, and all callers of [`fetch`](Self::fetch) while it runs share its outcome.
pub struct Query<T> {
    inner: Arc<QueryInner<T>>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueryInner<T> {
    id: u64,
    key: QueryKey,
    options: DefaultOptions,
    producer: QueryFn<T>,
    context: QueryContext,
    shared: Mutex<QueryShared<T>>,
}

struct QueryShared<T> {
    state: QueryState<T>,
    in_flight: Option<InFlight<T>>,
    fetch_counter: u64,
    /// Bumped by every [`Query::invalidate`].
    invalidations: u64,
    observers: BTreeMap<ObserverId, Arc<dyn QueryObserver<T>>>,
    active_count: usize,
    cache: Weak<CacheInner>,
    /// Removed from the cache by the garbage collector.
    retired: bool,
    /// Committed transitions that were not delivered yet, oldest first.
    pending: VecDeque<Notification<T>>,
    /// Someone is draining `pending`.
    delivering: bool,
}

impl<T> QueryShared<T> {
    fn is_current(&self, fetch_id: u64) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.id == fetch_id)
    }
}

struct InFlight<T> {
    id: u64,
    /// The invalidation count when the fetch started.
    invalidations: u64,
    channel: FetchChannel<T>,
    /// `None` between registering the fetch and spawning its task.
    abort: Option<AbortHandle>,
}

impl<T> InFlight<T> {
    fn abort(self) {
        metric!(counter("query.fetch.cancelled") += 1);
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

/// A committed transition, delivered once the query lock is released.
struct Notification<T> {
    query_id: u64,
    hash: QueryHash,
    state: QueryState<T>,
    observers: Vec<Arc<dyn QueryObserver<T>>>,
    cache: Weak<CacheInner>,
}

impl<T> Notification<T> {
    fn deliver(self) {
        for observer in &self.observers {
            observer.on_query_update(&self.state);
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.notify_updated(&self.hash, self.query_id);
        }
    }
}

/// Clears the delivering flag when an observer panics mid-delivery.
struct ResetOnPanic<'a, T>(&'a Mutex<QueryShared<T>>);

impl<T> Drop for ResetOnPanic<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().delivering = false;
        }
    }
}

fn wait_for<T: Clone>(channel: FetchChannel<T>) -> BoxFuture<'static, FetchResult<T>>
where
    T: Send + Sync + 'static,
{
    channel
        .map(|result| result.unwrap_or(Err(QueryError::Cancelled)))
        .boxed()
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a standalone query that is not part of any cache.
    ///
    /// Most queries are created through [`QueryClient::query`](crate::QueryClient::query), which
    /// also registers them in its cache and merges the client defaults.
    pub fn new(key: QueryKey, options: DefaultOptions, producer: QueryFn<T>) -> Self {
        Self::with_context(key, options, producer, QueryContext::default())
    }

    pub(crate) fn with_context(
        key: QueryKey,
        options: DefaultOptions,
        producer: QueryFn<T>,
        context: QueryContext,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let inner = QueryInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            key,
            options,
            producer,
            context,
            shared: Mutex::new(QueryShared {
                state: QueryState::default(),
                in_flight: None,
                fetch_counter: 0,
                invalidations: 0,
                observers: BTreeMap::new(),
                active_count: 0,
                cache: Weak::new(),
                retired: false,
                pending: VecDeque::new(),
                delivering: false,
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    pub fn hash(&self) -> &QueryHash {
        self.inner.key.hash()
    }

    /// The resolved options of this query.
    pub fn options(&self) -> &DefaultOptions {
        &self.inner.options
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.shared.lock().state.clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.shared.lock().state.data.clone()
    }

    pub fn summary(&self) -> StateSummary {
        self.inner.shared.lock().state.summary()
    }

    pub fn is_stale(&self) -> bool {
        let now = Instant::now();
        self.inner
            .shared
            .lock()
            .state
            .is_stale(now, self.inner.options.stale_time)
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.shared.lock().in_flight.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.options.enabled
    }

    pub fn active_count(&self) -> usize {
        self.inner.shared.lock().active_count
    }

    pub fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    pub fn observer_count(&self) -> usize {
        self.inner.shared.lock().observers.len()
    }

    /// Fetches the data, or joins the fetch that is already running.
    ///
    /// This is not an `async fn`: the fetch is spawned eagerly, and dropping the returned future
    /// does not cancel it. Every concurrent caller resolves to the same value or the same error.
    ///
    /// A disabled query never starts a fetch here. It resolves to its cached data, or to
    /// [`QueryError::Disabled`] if there is none. Use [`refetch`](Self::refetch) to fetch anyway.
    ///
    /// # Panics
    ///
    /// Starting a fetch panics outside of a tokio runtime.
    pub fn fetch(&self) -> BoxFuture<'static, FetchResult<T>> {
        let shared = self.inner.shared.lock();
        if let Some(in_flight) = &shared.in_flight {
            metric!(counter("query.fetch.deduplicated") += 1);
            return wait_for(in_flight.channel.clone());
        }

        if !self.inner.options.enabled {
            tracing::trace!(key = %self.inner.key, "query is disabled, not fetching");
            let result = shared.state.data.clone().ok_or(QueryError::Disabled);
            return future::ready(result).boxed();
        }

        self.inner.clone().spawn_fetch(shared)
    }

    /// Fetches the data regardless of staleness and of whether the query is enabled.
    ///
    /// A fetch that is already running is joined instead.
    pub fn refetch(&self) -> BoxFuture<'static, FetchResult<T>> {
        let shared = self.inner.shared.lock();
        if let Some(in_flight) = &shared.in_flight {
            metric!(counter("query.fetch.deduplicated") += 1);
            return wait_for(in_flight.channel.clone());
        }
        self.inner.clone().spawn_fetch(shared)
    }

    /// Fetches data that is newer than every invalidation made so far.
    ///
    /// A running fetch is joined if it started after the last [`invalidate`](Self::invalidate).
    /// An older one is awaited first, since its result is outdated, and then the query is fetched
    /// again. Like [`fetch`](Self::fetch), this happens whether or not the returned future is
    /// polled.
    ///
    /// # Panics
    ///
    /// Panics outside of a tokio runtime.
    pub fn revalidate(&self) -> BoxFuture<'static, FetchResult<T>> {
        let shared = self.inner.shared.lock();
        let Some(in_flight) = &shared.in_flight else {
            return self.inner.clone().spawn_fetch(shared);
        };
        if in_flight.invalidations == shared.invalidations {
            metric!(counter("query.fetch.deduplicated") += 1);
            return wait_for(in_flight.channel.clone());
        }

        let outdated = wait_for(in_flight.channel.clone());
        drop(shared);
        let query = self.clone();
        let handle = tokio::spawn(async move {
            // the outcome is superseded either way
            let _ = outdated.await;
            query.revalidate().await
        });
        handle
            .map(|result| result.unwrap_or(Err(QueryError::Cancelled)))
            .boxed()
    }

    /// Marks the data as stale without discarding it.
    ///
    /// A fetch that is running right now still settles, but its data stays invalidated.
    pub fn invalidate(&self) {
        let mut shared = self.inner.shared.lock();
        shared.invalidations += 1;
        self.inner.apply(&mut shared, QueryState::invalidate);
        drop(shared);
        self.inner.flush();
    }

    /// Cancels a running fetch and drops all data and errors.
    pub fn reset(&self) {
        let mut shared = self.inner.shared.lock();
        let in_flight = shared.in_flight.take();
        self.inner.apply(&mut shared, QueryState::reset);
        drop(shared);

        if let Some(in_flight) = in_flight {
            in_flight.abort();
        }
        self.inner.flush();
    }

    /// Aborts the running fetch, if any.
    ///
    /// Data and errors are kept, and every caller waiting on the fetch gets
    /// [`QueryError::Cancelled`].
    pub fn cancel(&self) {
        self.inner.cancel_in_flight();
    }

    /// Writes data directly, as if a fetch had just returned it.
    pub fn set_data(&self, data: T) {
        let now = Instant::now();
        self.inner.transition(|state| state.set_data(data, now));
    }

    /// Counts one more active consumer, and refetches according to the
    /// [`RefetchTrigger`](crate::RefetchTrigger) of this query.
    ///
    /// # Panics
    ///
    /// Starting a fetch panics outside of a tokio runtime.
    pub fn mark_active(&self) {
        self.inner.clone().mark_active();
    }

    pub fn mark_inactive(&self) {
        self.inner.mark_inactive();
    }

    /// Pushes every future state transition to `observer`, until the subscription is dropped.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: QueryObserver<T> + 'static,
    {
        let id = ObserverId::next();
        self.inner
            .shared
            .lock()
            .observers
            .insert(id, Arc::new(observer));

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(
            id,
            CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.unsubscribe(id);
                }
            }),
        )
    }

    /// Subscribes `observer` and marks the query active, for as long as the handle lives.
    pub fn observe<O>(&self, observer: O) -> ObserverHandle
    where
        O: QueryObserver<T> + 'static,
    {
        let subscription = self.subscribe(observer);
        self.mark_active();

        let inner = Arc::downgrade(&self.inner);
        ObserverHandle::new(
            subscription,
            CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.mark_inactive();
                }
            }),
        )
    }

    pub(crate) fn attach(&self, cache: &QueryCache) {
        self.inner.shared.lock().cache = cache.downgrade();
    }
}

impl<T> QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Commits `transition` and queues its notification.
    ///
    /// The caller must [`flush`](Self::flush) once it released the lock.
    fn apply<F>(&self, shared: &mut QueryShared<T>, transition: F)
    where
        F: FnOnce(QueryState<T>) -> QueryState<T>,
    {
        let state = mem::take(&mut shared.state);
        shared.state = transition(state);

        let notification = Notification {
            query_id: self.id,
            hash: self.key.hash().clone(),
            state: shared.state.clone(),
            observers: shared.observers.values().cloned().collect(),
            cache: shared.cache.clone(),
        };
        shared.pending.push_back(notification);
    }

    /// Delivers queued notifications in commit order.
    ///
    /// Only one caller drains at a time. Transitions committed meanwhile, including those made by
    /// observer callbacks, are delivered by the caller that is already draining.
    fn flush(&self) {
        let mut shared = self.shared.lock();
        if mem::replace(&mut shared.delivering, true) {
            return;
        }
        drop(shared);

        let _reset = ResetOnPanic(&self.shared);
        let mut shared = self.shared.lock();
        while let Some(notification) = shared.pending.pop_front() {
            MutexGuard::unlocked(&mut shared, || notification.deliver());
        }
        shared.delivering = false;
    }

    fn transition<F>(&self, transition: F)
    where
        F: FnOnce(QueryState<T>) -> QueryState<T>,
    {
        let mut shared = self.shared.lock();
        self.apply(&mut shared, transition);
        drop(shared);
        self.flush();
    }

    /// Applies `transition` only if `fetch_id` is still the running fetch.
    fn commit<F>(&self, fetch_id: u64, transition: F) -> bool
    where
        F: FnOnce(QueryState<T>) -> QueryState<T>,
    {
        let mut shared = self.shared.lock();
        if !shared.is_current(fetch_id) {
            return false;
        }
        self.apply(&mut shared, transition);
        drop(shared);
        self.flush();
        true
    }

    /// Registers a new fetch and spawns its task.
    ///
    /// Must be called with the lock held and no fetch running.
    fn spawn_fetch(
        self: Arc<Self>,
        mut shared: MutexGuard<'_, QueryShared<T>>,
    ) -> BoxFuture<'static, FetchResult<T>> {
        debug_assert!(shared.in_flight.is_none());

        shared.fetch_counter += 1;
        let fetch_id = shared.fetch_counter;
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        shared.in_flight = Some(InFlight {
            id: fetch_id,
            invalidations: shared.invalidations,
            channel: channel.clone(),
            abort: None,
        });
        self.apply(&mut shared, QueryState::start_fetch);
        let revived = self.revive(&mut shared);
        drop(shared);
        if let Some(cache) = revived {
            cache.restore(Arc::new(Query { inner: self.clone() }));
        }
        self.flush();

        let span = tracing::debug_span!(
            "query.fetch",
            key = %self.key,
            digest = %self.key.short_digest(),
            fetch = fetch_id
        );
        let task = {
            let inner = self.clone();
            let abandon_token = {
                let inner = Arc::downgrade(&self);
                CallOnDrop::new(move || {
                    if let Some(inner) = inner.upgrade() {
                        inner.abandon(fetch_id);
                    }
                })
            };
            async move {
                let started = Instant::now();
                let result = inner.run_fetch(fetch_id).await;
                let outcome = match &result {
                    Ok(_) => "success",
                    Err(error) => error.kind(),
                };
                metric!(timer("query.fetch.duration") = started.elapsed(), "outcome" => outcome);
                // Settling already cleared the fetch. The token only acts if the task panicked or
                // got aborted. Either way, callers see the outcome only after the slot is free.
                drop(abandon_token);
                sender.send(result).ok();
            }
            .instrument(span)
            .bind_hub(Hub::new_from_top(Hub::current()))
        };
        let handle = tokio::spawn(task);

        let mut shared = self.shared.lock();
        match &mut shared.in_flight {
            Some(in_flight) if in_flight.id == fetch_id => {
                in_flight.abort = Some(handle.abort_handle());
            }
            // cancelled before the task was spawned
            _ => handle.abort(),
        }
        drop(shared);

        wait_for(channel)
    }

    async fn run_fetch(&self, fetch_id: u64) -> FetchResult<T> {
        let retry = &self.options.retry;
        let mut failure_count: u32 = 0;

        loop {
            self.wait_until_online(fetch_id).await?;

            metric!(counter("query.fetch") += 1);
            let error = match (self.producer)(self.key.clone()).await {
                Ok(data) => return self.settle(fetch_id, Ok(data)),
                Err(error) => error,
            };

            if !retry.should_retry(failure_count, &error) {
                return self.settle(fetch_id, Err(error));
            }

            let delay = retry.delay_for_attempt(failure_count, &error);
            tracing::debug!(
                attempt = failure_count + 1,
                ?delay,
                %error,
                "fetch failed, retrying"
            );
            metric!(counter("query.retry") += 1, "error" => error.kind());

            if !self.commit(fetch_id, |state| state.record_failed_attempt(error)) {
                return Err(QueryError::Cancelled);
            }
            tokio::time::sleep(delay).await;
            failure_count = failure_count.saturating_add(1);
        }
    }

    /// Waits in [`FetchStatus::Paused`](crate::FetchStatus::Paused) while the client is offline.
    async fn wait_until_online(&self, fetch_id: u64) -> Result<(), QueryError> {
        let mut online = self.context.online.clone();
        let is_online = *online.borrow_and_update();
        if is_online {
            return Ok(());
        }

        tracing::debug!("client is offline, pausing fetch");
        if !self.commit(fetch_id, QueryState::pause) {
            return Err(QueryError::Cancelled);
        }
        // a closed channel cannot come back online, so fetch anyway
        let _ = online.wait_for(|online| *online).await;

        tracing::debug!("client is back online, resuming fetch");
        if !self.commit(fetch_id, QueryState::resume) {
            return Err(QueryError::Cancelled);
        }
        Ok(())
    }

    /// Records the outcome of a fetch and frees the in-flight slot.
    fn settle(&self, fetch_id: u64, result: FetchResult<T>) -> FetchResult<T> {
        let now = Instant::now();
        let mut shared = self.shared.lock();
        let in_flight = match shared.in_flight.take() {
            Some(in_flight) if in_flight.id == fetch_id => in_flight,
            other => {
                // cancelled or reset while the producer was running
                shared.in_flight = other;
                return Err(QueryError::Cancelled);
            }
        };
        // invalidated after the producer was called, so its data may predate the change
        let outdated = in_flight.invalidations != shared.invalidations;

        match &result {
            Ok(data) => self.apply(&mut shared, |state| {
                let state = state.succeed(data.clone(), now);
                match outdated {
                    true => state.invalidate(),
                    false => state,
                }
            }),
            Err(error) => self.apply(&mut shared, |state| state.fail(error.clone(), now)),
        }
        drop(shared);
        self.flush();

        if let Err(error) = &result {
            self.report_failure(error);
        }
        result
    }

    fn report_failure(&self, error: &QueryError) {
        tracing::warn!(key = %self.key, %error, "fetch failed");
        metric!(counter("query.fetch.failed") += 1, "error" => error.kind());

        if self.options.report_on_error.should_report(error) {
            self.context.reporter.report(&self.key, error);
        }
    }

    /// Returns to idle if the fetch task went away without settling.
    fn abandon(&self, fetch_id: u64) {
        let mut shared = self.shared.lock();
        if !shared.is_current(fetch_id) {
            return;
        }
        shared.in_flight = None;
        self.apply(&mut shared, QueryState::cancel);
        drop(shared);

        tracing::error!(key = %self.key, "fetch task ended without settling");
        self.flush();
    }

    fn cancel_in_flight(&self) -> bool {
        let mut shared = self.shared.lock();
        let Some(in_flight) = shared.in_flight.take() else {
            return false;
        };
        self.apply(&mut shared, QueryState::cancel);
        drop(shared);

        tracing::debug!(key = %self.key, "cancelling fetch");
        // abort outside of the lock, the task may need it to wind down
        in_flight.abort();
        self.flush();
        true
    }

    fn mark_active(self: Arc<Self>) {
        let mut shared = self.shared.lock();
        shared.active_count += 1;
        if let Some(cache) = self.revive(&mut shared) {
            drop(shared);
            cache.restore(Arc::new(Query { inner: self.clone() }));
            shared = self.shared.lock();
        }

        if shared.in_flight.is_some() || !self.options.enabled {
            return;
        }
        let is_stale = shared
            .state
            .is_stale(Instant::now(), self.options.stale_time);
        let summary = shared.state.summary();
        if self
            .options
            .refetch_trigger
            .should_refetch(&summary, is_stale)
        {
            tracing::trace!(key = %self.key, "refetching on activation");
            // the fetch keeps running without anyone waiting on it
            drop(self.clone().spawn_fetch(shared));
        }
    }

    /// Takes back a query the garbage collector removed, returning the cache to re-register with.
    fn revive(&self, shared: &mut QueryShared<T>) -> Option<QueryCache> {
        if !mem::take(&mut shared.retired) {
            return None;
        }
        tracing::trace!(key = %self.key, "collected query is in use again");
        shared.cache.upgrade().map(QueryCache::from_inner)
    }

    /// Marks the query retired if the garbage collector may remove it at `now`.
    fn try_retire(&self, now: Instant) -> bool {
        let mut shared = self.shared.lock();
        let eligible = shared.active_count == 0
            && shared.in_flight.is_none()
            && is_collectable(&shared.state.summary(), self.options.gc_time, now);
        shared.retired |= eligible;
        eligible
    }

    fn mark_inactive(&self) {
        let mut shared = self.shared.lock();
        shared.active_count = shared.active_count.saturating_sub(1);
    }

    fn unsubscribe(&self, id: ObserverId) {
        let mut shared = self.shared.lock();
        let removed = shared.observers.remove(&id).is_some();
        let was_last = removed && shared.observers.is_empty();
        let is_fetching = shared.in_flight.is_some();
        drop(shared);

        if was_last && is_fetching {
            tracing::debug!(key = %self.key, "last observer left");
            self.cancel_in_flight();
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("status", &shared.state.status)
            .field("fetch_status", &shared.state.fetch_status)
            .field("active_count", &shared.active_count)
            .finish()
    }
}

/// A query with its data type erased.
///
/// This is what the [`QueryCache`] stores, and what filters and bulk operations work with.
/// [`as_any`](Self::as_any) recovers the typed [`Query`].
pub trait AnyQuery: Send + Sync + 'static {
    fn key(&self) -> &QueryKey;

    fn hash(&self) -> &QueryHash {
        self.key().hash()
    }

    fn summary(&self) -> StateSummary;

    fn is_stale(&self, now: Instant) -> bool;

    /// The later of the data and error timestamps.
    fn last_updated(&self) -> Option<Instant> {
        let summary = self.summary();
        summary.data_updated_at.max(summary.error_updated_at)
    }

    fn active_count(&self) -> usize;

    fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    fn gc_time(&self) -> Duration;

    fn is_enabled(&self) -> bool;

    fn is_fetching(&self) -> bool;

    fn has_data(&self) -> bool {
        self.summary().has_data
    }

    fn invalidate(&self);

    /// Same as [`Query::revalidate`], discarding the data.
    fn revalidate(&self) -> BoxFuture<'static, Result<(), QueryError>>;

    /// Same as [`Query::fetch`], discarding the data.
    fn fetch(&self) -> BoxFuture<'static, Result<(), QueryError>>;

    /// Same as [`Query::refetch`], discarding the data.
    fn refetch(&self) -> BoxFuture<'static, Result<(), QueryError>>;

    fn reset(&self);

    fn cancel(&self);

    fn as_any(&self) -> &dyn Any;

    #[doc(hidden)]
    fn query_id(&self) -> u64;

    #[doc(hidden)]
    fn attach(&self, cache: &QueryCache);

    /// Checks garbage collection eligibility and detaches the query in one step, so that it
    /// cannot become active in between.
    #[doc(hidden)]
    fn try_retire(&self, now: Instant) -> bool;
}

impl<T> AnyQuery for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    fn summary(&self) -> StateSummary {
        Query::summary(self)
    }

    fn is_stale(&self, now: Instant) -> bool {
        self.inner
            .shared
            .lock()
            .state
            .is_stale(now, self.inner.options.stale_time)
    }

    fn active_count(&self) -> usize {
        Query::active_count(self)
    }

    fn gc_time(&self) -> Duration {
        self.inner.options.gc_time
    }

    fn is_enabled(&self) -> bool {
        Query::is_enabled(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn revalidate(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        Query::revalidate(self).map_ok(|_| ()).boxed()
    }

    fn fetch(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        Query::fetch(self).map_ok(|_| ()).boxed()
    }

    fn refetch(&self) -> BoxFuture<'static, Result<(), QueryError>> {
        Query::refetch(self).map_ok(|_| ()).boxed()
    }

    fn reset(&self) {
        Query::reset(self)
    }

    fn cancel(&self) {
        Query::cancel(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn query_id(&self) -> u64 {
        self.inner.id
    }

    fn attach(&self, cache: &QueryCache) {
        Query::attach(self, cache)
    }

    fn try_retire(&self, now: Instant) -> bool {
        self.inner.try_retire(now)
    }
}
