use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::cache::{CacheInner, QueryCache};

/// The default time between two sweeps.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically evicts inactive queries past their retention window.
///
/// The collector only holds weak references to the caches it monitors, so it never keeps a cache
/// alive. Its background task starts with the first [`register`](Self::register)ed cache and
/// stops by itself once all registered caches are gone.
///
/// See [`is_eligible_for_gc`](crate::cache::is_eligible_for_gc) for which queries get removed.
#[derive(Clone)]
pub struct GarbageCollector {
    inner: Arc<CollectorInner>,
}

struct CollectorInner {
    interval: watch::Sender<Duration>,
    state: Mutex<CollectorState>,
}

#[derive(Default)]
struct CollectorState {
    caches: Vec<Weak<CacheInner>>,
    task: Option<AbortHandle>,
}

impl CollectorState {
    fn live_caches(&mut self) -> Vec<QueryCache> {
        let mut live = Vec::with_capacity(self.caches.len());
        self.caches.retain(|cache| match cache.upgrade() {
            Some(cache) => {
                live.push(QueryCache::from_inner(cache));
                true
            }
            None => false,
        });
        live
    }
}

impl Drop for CollectorInner {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.abort();
        }
    }
}

impl GarbageCollector {
    pub fn new(interval: Duration) -> Self {
        let (interval, _) = watch::channel(interval);
        Self {
            inner: Arc::new(CollectorInner {
                interval,
                state: Mutex::new(CollectorState::default()),
            }),
        }
    }

    /// Starts monitoring `cache`, and starts the background task unless it is running already.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn register(&self, cache: &QueryCache) {
        let mut state = self.inner.state.lock();
        let weak = cache.downgrade();
        if !state.caches.iter().any(|cache| cache.ptr_eq(&weak)) {
            state.caches.push(weak);
        }

        if state.task.is_none() {
            let task = run_collector(Arc::downgrade(&self.inner), self.inner.interval.subscribe())
                .bind_hub(Hub::new_from_top(Hub::current()));
            state.task = Some(tokio::spawn(task).abort_handle());
            tracing::debug!(interval = ?self.interval(), "garbage collector started");
        }
    }

    /// Stops monitoring `cache`.
    pub fn unregister(&self, cache: &QueryCache) {
        let weak = cache.downgrade();
        self.inner
            .state
            .lock()
            .caches
            .retain(|cache| !cache.ptr_eq(&weak));
    }

    pub fn interval(&self) -> Duration {
        *self.inner.interval.borrow()
    }

    /// Changes the time between two sweeps. A running timer starts over.
    pub fn set_interval(&self, interval: Duration) {
        self.inner.interval.send_replace(interval);
    }

    /// Runs one pass over all registered caches right now.
    ///
    /// Returns the number of removed queries.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    /// Stops the background task. Registering another cache starts it again.
    pub fn stop(&self) {
        if let Some(task) = self.inner.state.lock().task.take() {
            task.abort();
        }
    }
}

impl CollectorInner {
    fn sweep(&self) -> usize {
        let caches = self.state.lock().live_caches();
        let now = Instant::now();

        let removed: usize = caches
            .iter()
            .map(|cache| cache.collect_garbage(now))
            .sum();
        if removed > 0 {
            tracing::debug!(removed, caches = caches.len(), "garbage collected queries");
        }
        removed
    }

    /// Clears the task slot if no cache is left, which ends the task.
    fn stop_if_idle(&self) -> bool {
        let mut state = self.state.lock();
        if !state.live_caches().is_empty() {
            return false;
        }
        state.task = None;
        true
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new(DEFAULT_GC_INTERVAL)
    }
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn run_collector(collector: Weak<CollectorInner>, mut interval: watch::Receiver<Duration>) {
    loop {
        let period = *interval.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = interval.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::debug!(interval = ?*interval.borrow(), "garbage collector interval changed");
                continue;
            }
        }

        let Some(collector) = collector.upgrade() else {
            break;
        };
        collector.sweep();
        if collector.stop_if_idle() {
            tracing::debug!("no caches left, garbage collector stopped");
            break;
        }
    }
}
