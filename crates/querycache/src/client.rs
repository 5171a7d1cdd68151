use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::error::QueryError;
use crate::gc::GarbageCollector;
use crate::key::QueryKey;
use crate::options::{DefaultOptions, QueryOptions};
use crate::query::{AnyQuery, Query, QueryContext, query_fn};
use crate::reporting::{ErrorReporter, SentryReporter};
use crate::state::QueryState;

/// Which queries a filter selects by activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QueryType {
    #[default]
    All,
    /// Queries with at least one active observer.
    Active,
    /// Queries without active observers.
    Inactive,
}

/// Which of the invalidated queries get refetched right away.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RefetchType {
    /// Only mark them invalidated.
    None,
    #[default]
    Active,
    Inactive,
    All,
}

impl RefetchType {
    fn selects(self, query: &dyn AnyQuery) -> bool {
        match self {
            Self::None => false,
            Self::Active => query.is_active(),
            Self::Inactive => !query.is_active(),
            Self::All => true,
        }
    }
}

type FilterPredicate = Arc<dyn Fn(&dyn AnyQuery) -> bool + Send + Sync>;

/// Selects the queries a bulk operation applies to.
///
/// All conditions that are set must hold. The default filter matches every query.
#[derive(Clone, Default)]
pub struct QueryFilter {
    key: Option<QueryKey>,
    exact: bool,
    query_type: QueryType,
    stale: Option<bool>,
    fetching: Option<bool>,
    predicate: Option<FilterPredicate>,
}

impl QueryFilter {
    /// Matches every query.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches queries whose key starts with `key`, see [`QueryKey::matches_prefix`].
    pub fn prefix(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    /// Matches the query with exactly this key.
    pub fn exact(key: QueryKey) -> Self {
        Self {
            key: Some(key),
            exact: true,
            ..Self::default()
        }
    }

    pub fn query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    pub fn fetching(mut self, fetching: bool) -> Self {
        self.fetching = Some(fetching);
        self
    }

    /// Adds a custom condition.
    pub fn predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&dyn AnyQuery) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, query: &dyn AnyQuery, now: Instant) -> bool {
        if let Some(key) = &self.key {
            let key_matches = if self.exact {
                query.hash() == key.hash()
            } else {
                query.key().matches_prefix(key)
            };
            if !key_matches {
                return false;
            }
        }

        let type_matches = match self.query_type {
            QueryType::All => true,
            QueryType::Active => query.is_active(),
            QueryType::Inactive => !query.is_active(),
        };
        if !type_matches {
            return false;
        }

        if self.stale.is_some_and(|stale| query.is_stale(now) != stale) {
            return false;
        }
        if self
            .fetching
            .is_some_and(|fetching| query.is_fetching() != fetching)
        {
            return false;
        }

        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(query))
    }
}

impl fmt::Debug for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilter")
            .field("key", &self.key)
            .field("exact", &self.exact)
            .field("query_type", &self.query_type)
            .field("stale", &self.stale)
            .field("fetching", &self.fetching)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

/// How a bulk refetch went.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefetchSummary {
    pub succeeded: usize,
    /// Includes cancelled fetches.
    pub failed: usize,
}

impl RefetchSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// The outcome of a bulk refetch.
///
/// The fetches run whether or not this handle is awaited; awaiting it only collects their
/// outcomes. Dropping it detaches.
#[must_use = "the refetches run regardless, await the handle to learn how they went"]
pub struct RefetchHandle {
    len: usize,
    outcome: BoxFuture<'static, RefetchSummary>,
}

impl RefetchHandle {
    fn new(fetches: Vec<BoxFuture<'static, Result<(), QueryError>>>) -> Self {
        let len = fetches.len();
        let outcome = future::join_all(fetches)
            .map(|results| {
                let succeeded = results.iter().filter(|result| result.is_ok()).count();
                RefetchSummary {
                    succeeded,
                    failed: results.len() - succeeded,
                }
            })
            .boxed();
        Self { len, outcome }
    }

    /// The number of queries being refetched.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Future for RefetchHandle {
    type Output = RefetchSummary;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.poll_unpin(cx)
    }
}

impl fmt::Debug for RefetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefetchHandle")
            .field("len", &self.len)
            .finish()
    }
}

/// The entry point for working with queries.
///
/// A client owns one [`QueryCache`] and the [`DefaultOptions`] every new query is resolved
/// against. It creates queries, reads and writes their data, and applies bulk operations to
/// filtered sets of them.
///
/// The client is a cheap handle; clones refer to the same cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cache: QueryCache,
    defaults: DefaultOptions,
    reporter: Arc<dyn ErrorReporter>,
    online: watch::Sender<bool>,
    collector: Mutex<Option<GarbageCollector>>,
}

impl QueryClient {
    pub fn new(defaults: DefaultOptions) -> Self {
        Self::with_reporter(defaults, Arc::new(SentryReporter))
    }

    /// Creates a client that escalates errors to `reporter` instead of Sentry.
    pub fn with_reporter(defaults: DefaultOptions, reporter: Arc<dyn ErrorReporter>) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(ClientInner {
                cache: QueryCache::new(),
                defaults,
                reporter,
                online,
                collector: Mutex::new(None),
            }),
        }
    }

    /// Creates a client with the query defaults of `config`, and mounts a garbage collector
    /// unless it is disabled there.
    ///
    /// # Panics
    ///
    /// Starting the collector panics outside of a tokio runtime.
    pub fn from_config(config: &Config) -> Self {
        let client = Self::new(config.queries.into());
        if config.gc.enabled {
            client.mount(&GarbageCollector::new(config.gc.interval));
        }
        client
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn defaults(&self) -> &DefaultOptions {
        &self.inner.defaults
    }

    /// Registers the cache of this client with `collector`, and keeps the collector alive for as
    /// long as the client lives.
    ///
    /// # Panics
    ///
    /// Starting the collector panics outside of a tokio runtime.
    pub fn mount(&self, collector: &GarbageCollector) {
        collector.register(&self.inner.cache);
        *self.inner.collector.lock() = Some(collector.clone());
    }

    /// The collector this client is mounted on.
    pub fn collector(&self) -> Option<GarbageCollector> {
        self.inner.collector.lock().clone()
    }

    fn context(&self) -> QueryContext {
        QueryContext {
            online: self.inner.online.subscribe(),
            reporter: self.inner.reporter.clone(),
        }
    }

    /// Returns the query for `key`, creating it if needed.
    ///
    /// `options` are resolved against the client defaults when the query is created. For a query
    /// that exists already, `options` and `producer` are ignored.
    ///
    /// # Errors
    ///
    /// Fails with [`QueryError::InvalidConfiguration`] if the existing query for `key` holds a
    /// different data type.
    pub fn query<T, F, Fut, E>(
        &self,
        key: QueryKey,
        options: QueryOptions,
        producer: F,
    ) -> Result<Query<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError> + 'static,
    {
        self.inner.cache.get_or_create(&key, || {
            let options = options.resolve(&self.inner.defaults);
            Query::with_context(key.clone(), options, query_fn(producer), self.context())
        })
    }

    /// Returns the cached data if it is fresh, otherwise fetches it.
    pub async fn fetch_query<T, F, Fut, E>(
        &self,
        key: QueryKey,
        options: QueryOptions,
        producer: F,
    ) -> Result<T, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError> + 'static,
    {
        let query = self.query(key, options, producer)?;
        if !query.is_stale() {
            if let Some(data) = query.data() {
                return Ok(data);
            }
        }
        query.fetch().await
    }

    /// Like [`fetch_query`](Self::fetch_query), but only warms the cache.
    pub async fn prefetch_query<T, F, Fut, E>(
        &self,
        key: QueryKey,
        options: QueryOptions,
        producer: F,
    ) where
        T: Clone + Send + Sync + 'static,
        F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<QueryError> + 'static,
    {
        let key_display = key.to_string();
        if let Err(error) = self.fetch_query(key, options, producer).await {
            tracing::debug!(key = %key_display, %error, "prefetch failed");
        }
    }

    pub fn get_query_data<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.cache.get_typed::<T>(key)?.data()
    }

    pub fn get_query_state<T>(&self, key: &QueryKey) -> Option<QueryState<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Some(self.inner.cache.get_typed::<T>(key)?.state())
    }

    /// Writes `data` into the existing query for `key`.
    ///
    /// Returns `false` if there is no such query, or if it holds a different data type.
    pub fn set_query_data<T>(&self, key: &QueryKey, data: T) -> bool
    where
        T: Clone + Send + Sync + 'static,
    {
        match self.inner.cache.get_typed::<T>(key) {
            Some(query) => {
                query.set_data(data);
                true
            }
            None => false,
        }
    }

    fn matching(&self, filter: &QueryFilter) -> Vec<Arc<dyn AnyQuery>> {
        let now = Instant::now();
        self.inner
            .cache
            .find_all(|query| filter.matches(query, now))
    }

    /// Marks all matching queries invalidated, then refetches the ones selected by `refetch`.
    ///
    /// Disabled queries are invalidated but never refetched. A query that was already fetching
    /// only counts as refetched once a fetch started after the invalidation settles, see
    /// [`Query::revalidate`]. The refetches run concurrently and independently of the returned
    /// handle.
    pub fn invalidate_queries(&self, filter: &QueryFilter, refetch: RefetchType) -> RefetchHandle {
        let queries = self.matching(filter);
        for query in &queries {
            query.invalidate();
        }

        let fetches: Vec<_> = queries
            .iter()
            .filter(|query| query.is_enabled() && refetch.selects(query.as_ref()))
            .map(|query| query.revalidate())
            .collect();
        tracing::debug!(
            invalidated = queries.len(),
            refetching = fetches.len(),
            "invalidated queries"
        );
        RefetchHandle::new(fetches)
    }

    /// Refetches all matching enabled queries, regardless of staleness.
    pub fn refetch_queries(&self, filter: &QueryFilter) -> RefetchHandle {
        let fetches = self
            .matching(filter)
            .iter()
            .filter(|query| query.is_enabled())
            .map(|query| query.refetch())
            .collect();
        RefetchHandle::new(fetches)
    }

    /// Resets all matching queries. Returns how many there were.
    pub fn reset_queries(&self, filter: &QueryFilter) -> usize {
        let queries = self.matching(filter);
        for query in &queries {
            query.reset();
        }
        queries.len()
    }

    /// Removes all matching queries from the cache, or all queries if `filter` is `None`.
    ///
    /// Returns how many were removed.
    pub fn remove_queries(&self, filter: Option<&QueryFilter>) -> usize {
        let Some(filter) = filter else {
            let len = self.inner.cache.len();
            self.inner.cache.clear();
            return len;
        };

        self.matching(filter)
            .iter()
            .filter(|query| self.inner.cache.remove(query.hash()).is_some())
            .count()
    }

    /// Cancels the running fetches of all matching queries. Returns how many were cancelled.
    pub fn cancel_queries(&self, filter: &QueryFilter) -> usize {
        let fetching = filter.clone().fetching(true);
        let queries = self.matching(&fetching);
        for query in &queries {
            query.cancel();
        }
        queries.len()
    }

    /// The number of matching queries that are fetching.
    pub fn is_fetching(&self, filter: &QueryFilter) -> usize {
        self.matching(&filter.clone().fetching(true)).len()
    }

    /// Removes every query.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    /// Switches connectivity. While offline, fetches wait before calling their producer.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(DefaultOptions::default())
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("defaults", &self.inner.defaults)
            .field("online", &self.is_online())
            .finish()
    }
}
