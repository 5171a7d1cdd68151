use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::state::QueryState;
use crate::utils::CallOnDrop;

/// Receives every committed state transition of a [`Query`](crate::Query).
///
/// This is the seam a presentation layer plugs into: it re-renders from the snapshot it is handed,
/// or schedules a re-render. Callbacks run after the transition was committed and the query lock
/// was released, so they may call back into the query.
///
/// Snapshots arrive in commit order. A transition made from inside a callback is delivered once
/// the current snapshot reached every observer.
pub trait QueryObserver<T>: Send + Sync {
    fn on_query_update(&self, state: &QueryState<T>);
}

impl<T, F> QueryObserver<T> for F
where
    F: Fn(&QueryState<T>) + Send + Sync,
{
    fn on_query_update(&self, state: &QueryState<T>) {
        self(state)
    }
}

/// Identifies one subscription of one observer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Keeps an observer subscribed. Dropping it unsubscribes.
///
/// Once the last subscription of a query goes away while a fetch is outstanding, that fetch is
/// cancelled.
#[must_use = "dropping a subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    id: ObserverId,
    _unsubscribe: CallOnDrop,
}

impl Subscription {
    pub(crate) fn new(id: ObserverId, unsubscribe: CallOnDrop) -> Self {
        Self {
            id,
            _unsubscribe: unsubscribe,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Unsubscribes now. Same as dropping.
    pub fn unsubscribe(self) {}
}

/// An attached, active observer.
///
/// This is what a view holds while it is on screen: the query counts as active and pushes updates
/// to the observer. Dropping the handle marks the query inactive again and unsubscribes.
#[must_use = "dropping an observer handle detaches it immediately"]
#[derive(Debug)]
pub struct ObserverHandle {
    // field order is drop order: go inactive before unsubscribing
    _active: CallOnDrop,
    subscription: Subscription,
}

impl ObserverHandle {
    pub(crate) fn new(subscription: Subscription, active: CallOnDrop) -> Self {
        Self {
            _active: active,
            subscription,
        }
    }

    pub fn id(&self) -> ObserverId {
        self.subscription.id()
    }

    /// Detaches now. Same as dropping.
    pub fn detach(self) {}
}
