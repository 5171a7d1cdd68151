use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::query::{AnyQuery, Query};
use crate::state::{FetchStatus, StateSummary};
use crate::utils::CallOnDrop;

/// The canonical string form of a [`QueryKey`], as returned by [`QueryKey::hash`].
pub type QueryHash = Arc<str>;

/// A structural change of a [`QueryCache`], or a state change of one of its queries.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum CacheEvent {
    Added(QueryHash),
    Removed(QueryHash),
    /// A query committed a state transition.
    Updated(QueryHash),
    /// All queries were removed at once.
    Cleared,
}

type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct CacheInner {
    queries: Mutex<FxHashMap<QueryHash, Arc<dyn AnyQuery>>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl CacheInner {
    /// Delivers `event` to all listeners, in registration order.
    ///
    /// Must be called without holding the queries lock.
    fn emit(&self, event: &CacheEvent) {
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Emits [`CacheEvent::Updated`] if the query is still the one stored under `hash`.
    pub(crate) fn notify_updated(&self, hash: &QueryHash, query_id: u64) {
        let is_member = self
            .queries
            .lock()
            .get(hash)
            .is_some_and(|query| query.query_id() == query_id);
        if is_member {
            self.emit(&CacheEvent::Updated(hash.clone()));
        }
    }
}

/// The registry of queries, keyed by [`QueryHash`].
///
/// Every structural change is applied under one lock, which makes get-or-create atomic: two
/// concurrent first accesses of the same key end up with the same [`Query`]. Listeners are
/// notified after the change is committed and the lock is released.
///
/// The cache is a cheap handle; clones refer to the same registry.
#[derive(Clone, Default)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> Weak<CacheInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<CacheInner>) -> Self {
        Self { inner }
    }

    /// Returns the query stored under `key`, or stores the one built by `create`.
    ///
    /// # Errors
    ///
    /// Fails with [`QueryError::InvalidConfiguration`] if a query with a different data type is
    /// already stored under the same key.
    pub fn get_or_create<T, F>(&self, key: &QueryKey, create: F) -> Result<Query<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Query<T>,
    {
        let mut queries = self.inner.queries.lock();
        if let Some(existing) = queries.get(key.hash()) {
            return downcast(existing.as_ref());
        }

        let query = create();
        query.attach(self);
        queries.insert(key.hash().clone(), Arc::new(query.clone()));
        drop(queries);

        tracing::trace!(%key, "query added");
        metric!(counter("query.cache.added") += 1);
        self.inner.emit(&CacheEvent::Added(key.hash().clone()));
        Ok(query)
    }

    /// Stores `query`, replacing and cancelling any query stored under the same hash.
    pub fn add(&self, query: Arc<dyn AnyQuery>) -> Option<Arc<dyn AnyQuery>> {
        let hash = query.hash().clone();
        query.attach(self);
        let previous = self.inner.queries.lock().insert(hash.clone(), query);

        if let Some(previous) = &previous {
            previous.cancel();
            self.inner.emit(&CacheEvent::Removed(hash.clone()));
        }
        metric!(counter("query.cache.added") += 1);
        self.inner.emit(&CacheEvent::Added(hash));
        previous
    }

    /// Stores a query the garbage collector removed, unless its slot was taken meanwhile.
    pub(crate) fn restore(&self, query: Arc<dyn AnyQuery>) -> bool {
        let hash = query.hash().clone();
        match self.inner.queries.lock().entry(hash.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => slot.insert(query),
        };

        tracing::trace!(%hash, "query restored");
        metric!(counter("query.cache.added") += 1);
        self.inner.emit(&CacheEvent::Added(hash));
        true
    }

    /// Removes the query stored under `hash`, cancelling its running fetch.
    pub fn remove(&self, hash: &str) -> Option<Arc<dyn AnyQuery>> {
        let removed = self.inner.queries.lock().remove(hash)?;
        removed.cancel();

        metric!(counter("query.cache.removed") += 1);
        self.inner.emit(&CacheEvent::Removed(removed.hash().clone()));
        Some(removed)
    }

    pub fn get(&self, hash: &str) -> Option<Arc<dyn AnyQuery>> {
        self.inner.queries.lock().get(hash).cloned()
    }

    /// Returns the typed query stored under `key`.
    ///
    /// Returns `None` if there is none, or if it holds a different data type.
    pub fn get_typed<T>(&self, key: &QueryKey) -> Option<Query<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let query = self.get(key.hash())?;
        downcast(query.as_ref()).ok()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.queries.lock().contains_key(hash)
    }

    /// Returns any query matching `predicate`.
    pub fn find<P>(&self, predicate: P) -> Option<Arc<dyn AnyQuery>>
    where
        P: Fn(&dyn AnyQuery) -> bool,
    {
        self.inner
            .queries
            .lock()
            .values()
            .find(|query| predicate(query.as_ref()))
            .cloned()
    }

    /// Returns all queries matching `predicate`, in no particular order.
    pub fn find_all<P>(&self, predicate: P) -> Vec<Arc<dyn AnyQuery>>
    where
        P: Fn(&dyn AnyQuery) -> bool,
    {
        self.inner
            .queries
            .lock()
            .values()
            .filter(|query| predicate(query.as_ref()))
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn AnyQuery>> {
        self.find_all(|_| true)
    }

    /// Removes all queries, emitting a single [`CacheEvent::Cleared`].
    pub fn clear(&self) {
        let removed = std::mem::take(&mut *self.inner.queries.lock());
        for query in removed.values() {
            query.cancel();
        }

        tracing::debug!(count = removed.len(), "cache cleared");
        metric!(counter("query.cache.removed") += removed.len() as i64);
        self.inner.emit(&CacheEvent::Cleared);
    }

    pub fn len(&self) -> usize {
        self.inner.queries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `listener` with every future [`CacheEvent`], until the subscription is dropped.
    ///
    /// Listeners run synchronously on the thread that caused the event.
    pub fn subscribe<L>(&self, listener: L) -> CacheSubscription
    where
        L: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));

        let inner = Arc::downgrade(&self.inner);
        CacheSubscription {
            _unsubscribe: CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner
                        .listeners
                        .lock()
                        .retain(|(listener_id, _)| *listener_id != id);
                }
            }),
        }
    }

    /// Removes every query that is eligible for garbage collection at `now`.
    ///
    /// Eligibility is decided under the lock of each query while the cache is locked. A removed
    /// query that is activated or fetched later through a retained handle puts itself back.
    ///
    /// Returns the number of removed queries.
    pub fn collect_garbage(&self, now: Instant) -> usize {
        let mut queries = self.inner.queries.lock();
        let mut eligible = Vec::new();
        queries.retain(|hash, query| {
            let retired = query.try_retire(now);
            if retired {
                eligible.push(hash.clone());
            }
            !retired
        });
        let remaining = queries.len();
        drop(queries);

        for hash in &eligible {
            tracing::trace!(%hash, "query garbage collected");
            self.inner.emit(&CacheEvent::Removed(hash.clone()));
        }
        metric!(counter("query.gc.removed") += eligible.len() as i64);
        metric!(gauge("query.cache.size") = remaining as u64);
        eligible.len()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("len", &self.len())
            .finish()
    }
}

fn downcast<T>(query: &dyn AnyQuery) -> Result<Query<T>, QueryError>
where
    T: Clone + Send + Sync + 'static,
{
    query.as_any().downcast_ref::<Query<T>>().cloned().ok_or_else(|| {
        QueryError::InvalidConfiguration(format!(
            "query {} holds a different data type than `{}`",
            query.key(),
            std::any::type_name::<T>()
        ))
    })
}

/// Whether `query` may be removed by the garbage collector at `now`.
///
/// Active or fetching queries are never eligible. Queries without data are eligible right away,
/// all others once `gc_time` has passed since they were last updated.
pub fn is_eligible_for_gc(query: &dyn AnyQuery, now: Instant) -> bool {
    !query.is_active() && is_collectable(&query.summary(), query.gc_time(), now)
}

/// The part of [`is_eligible_for_gc`] that only looks at the state.
pub(crate) fn is_collectable(summary: &StateSummary, gc_time: Duration, now: Instant) -> bool {
    if summary.fetch_status != FetchStatus::Idle {
        return false;
    }
    if !summary.has_data {
        return true;
    }
    match summary.data_updated_at.max(summary.error_updated_at) {
        Some(last_updated) => now.saturating_duration_since(last_updated) >= gc_time,
        None => true,
    }
}

/// Keeps a cache listener registered. Dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct CacheSubscription {
    _unsubscribe: CallOnDrop,
}

impl CacheSubscription {
    /// Unsubscribes now. Same as dropping.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DefaultOptions;
    use crate::query::query_fn;

    fn constant_query<T>(key: &QueryKey, value: T, options: DefaultOptions) -> Query<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let producer = query_fn(move |_key| {
            let value = value.clone();
            async move { Ok::<_, QueryError>(value) }
        });
        Query::new(key.clone(), options, producer)
    }

    fn record_events(cache: &QueryCache) -> (Arc<Mutex<Vec<CacheEvent>>>, CacheSubscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscription = {
            let events = events.clone();
            cache.subscribe(move |event| events.lock().push(event.clone()))
        };
        (events, subscription)
    }

    #[test]
    fn test_get_or_create_returns_same_query() {
        let cache = QueryCache::new();
        let key = QueryKey::from("posts");

        let first = cache
            .get_or_create(&key, || constant_query(&key, 1u32, Default::default()))
            .unwrap();
        first.set_data(5);

        let second = cache
            .get_or_create(&key, || constant_query(&key, 2u32, Default::default()))
            .unwrap();
        assert_eq!(second.data(), Some(5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_type_mismatch() {
        let cache = QueryCache::new();
        let key = QueryKey::from("posts");
        cache
            .get_or_create(&key, || constant_query(&key, 1u32, Default::default()))
            .unwrap();

        let err = cache
            .get_or_create(&key, || constant_query(&key, "one", Default::default()))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfiguration(_)));
        assert!(cache.get_typed::<&str>(&key).is_none());
        assert!(cache.get_typed::<u32>(&key).is_some());
    }

    #[test]
    fn test_events() {
        let cache = QueryCache::new();
        let (events, _subscription) = record_events(&cache);

        let posts = QueryKey::from("posts");
        let users = QueryKey::from("users");
        let query = cache
            .get_or_create(&posts, || constant_query(&posts, 1, Default::default()))
            .unwrap();
        cache
            .get_or_create(&users, || constant_query(&users, 2, Default::default()))
            .unwrap();
        query.set_data(3);
        cache.remove(posts.hash());
        // a removed query no longer reports to the cache
        query.set_data(4);
        cache.clear();

        assert_eq!(
            *events.lock(),
            [
                CacheEvent::Added(posts.hash().clone()),
                CacheEvent::Added(users.hash().clone()),
                CacheEvent::Updated(posts.hash().clone()),
                CacheEvent::Removed(posts.hash().clone()),
                CacheEvent::Cleared,
            ]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_listeners_see_committed_state() {
        let cache = QueryCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let seen = seen.clone();
            let weak = cache.downgrade();
            cache.subscribe(move |event| {
                if let Some(inner) = weak.upgrade() {
                    let cache = QueryCache::from_inner(inner);
                    seen.lock().push((event.clone(), cache.len()));
                }
            })
        };

        let key = QueryKey::from("posts");
        cache
            .get_or_create(&key, || constant_query(&key, 1, Default::default()))
            .unwrap();
        cache.remove(key.hash());

        assert_eq!(
            *seen.lock(),
            [
                (CacheEvent::Added(key.hash().clone()), 1),
                (CacheEvent::Removed(key.hash().clone()), 0),
            ]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let cache = QueryCache::new();
        let (events, subscription) = record_events(&cache);
        subscription.unsubscribe();

        cache.clear();
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_find() {
        let cache = QueryCache::new();
        for page in 1..=3 {
            let key = QueryKey::from(serde_json::json!(["posts", page]));
            cache
                .get_or_create(&key, || constant_query(&key, page, Default::default()))
                .unwrap();
        }
        let key = QueryKey::from("users");
        cache
            .get_or_create(&key, || constant_query(&key, 0, Default::default()))
            .unwrap();

        let prefix = QueryKey::from(serde_json::json!(["posts"]));
        assert_eq!(cache.find_all(|q| q.key().matches_prefix(&prefix)).len(), 3);
        assert!(cache.find(|q| q.hash().as_ref() == r#""users""#).is_some());
        assert!(cache.find(|q| q.hash().as_ref() == r#""nope""#).is_none());
        assert_eq!(cache.all().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_fetch() {
        let cache = QueryCache::new();
        let key = QueryKey::from("slow");
        let query = cache
            .get_or_create(&key, || {
                Query::new(
                    key.clone(),
                    DefaultOptions::default(),
                    query_fn(|_key| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok::<_, QueryError>(())
                    }),
                )
            })
            .unwrap();

        let waiting = query.fetch();
        cache.remove(key.hash());
        assert_eq!(waiting.await, Err(QueryError::Cancelled));
        assert!(!query.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_garbage() {
        let cache = QueryCache::new();
        let options = DefaultOptions {
            gc_time: Duration::from_secs(60),
            ..Default::default()
        };

        let stored = QueryKey::from("stored");
        let stored_query = cache
            .get_or_create(&stored, || constant_query(&stored, 1, options.clone()))
            .unwrap();
        stored_query.set_data(1);

        let watched = QueryKey::from("watched");
        let watched_query = cache
            .get_or_create(&watched, || constant_query(&watched, 2, options.clone()))
            .unwrap();
        watched_query.set_data(2);
        watched_query.mark_active();

        let empty = QueryKey::from("empty");
        cache
            .get_or_create(&empty, || constant_query(&empty, 3, options.clone()))
            .unwrap();

        // queries without data go first
        assert_eq!(cache.collect_garbage(Instant::now()), 1);
        assert!(!cache.contains(empty.hash()));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.collect_garbage(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.collect_garbage(Instant::now()), 1);
        assert!(!cache.contains(stored.hash()));

        // active queries are retained regardless of age
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.collect_garbage(Instant::now()), 0);
        assert!(cache.contains(watched.hash()));

        watched_query.mark_inactive();
        assert_eq!(cache.collect_garbage(Instant::now()), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collected_query_returns_when_used() {
        let cache = QueryCache::new();
        let (events, _subscription) = record_events(&cache);
        let key = QueryKey::from("held");
        let query = cache
            .get_or_create(&key, || constant_query(&key, 1, Default::default()))
            .unwrap();

        assert_eq!(cache.collect_garbage(Instant::now()), 1);
        assert!(!cache.contains(key.hash()));

        // activating a retained handle registers it again
        query.mark_active();
        assert_eq!(query.fetch().await, Ok(1));
        let stored = cache.get_typed::<i32>(&key).unwrap();
        stored.set_data(5);
        assert_eq!(query.data(), Some(5));
        assert_eq!(cache.collect_garbage(Instant::now()), 0);

        let structural: Vec<_> = events
            .lock()
            .iter()
            .filter(|event| !matches!(event, CacheEvent::Updated(_)))
            .cloned()
            .collect();
        assert_eq!(
            structural,
            [
                CacheEvent::Added(key.hash().clone()),
                CacheEvent::Removed(key.hash().clone()),
                CacheEvent::Added(key.hash().clone()),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_activation_racing_collection() {
        let cache = QueryCache::new();
        let options = DefaultOptions {
            enabled: false,
            ..Default::default()
        };

        for round in 0..200 {
            let key = QueryKey::from(serde_json::json!(["race", round]));
            let query = cache
                .get_or_create(&key, || constant_query(&key, round, options.clone()))
                .unwrap();

            let barrier = Arc::new(tokio::sync::Barrier::new(2));
            let collector = {
                let cache = cache.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.collect_garbage(Instant::now());
                })
            };
            let activator = {
                let query = query.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    query.mark_active();
                })
            };
            collector.await.unwrap();
            activator.await.unwrap();

            // whichever ran first, an active query is the one stored under its key
            let stored = cache.get(key.hash()).unwrap();
            assert_eq!(stored.query_id(), AnyQuery::query_id(&query));
            query.mark_inactive();
        }
    }
}
