//! # querycache
//!
//! An asynchronous data cache keyed by structured query keys.
//!
//! Given a [`QueryKey`] and an async producer, a [`Query`] fetches, caches, deduplicates,
//! retries, invalidates and eventually garbage-collects the produced value. Presentation layers
//! attach to queries as observers and react to state changes instead of re-issuing work.
//!
//! ## Moving parts
//!
//! - [`QueryKey`] canonicalizes a structured key into a stable, field-order independent hash.
//! - [`RetryPolicy`] decides whether a failed fetch is retried, and after which delay.
//! - [`QueryState`] is the snapshot of one key's data, error, status and timestamps. It only
//!   changes through its transition functions.
//! - [`Query`] is the per-key state machine and the unit of deduplication: all concurrent
//!   [`Query::fetch`] calls while a fetch is in flight share that one fetch.
//! - [`QueryCache`] is the registry of queries keyed by hash, and emits [`CacheEvent`]s.
//! - [`QueryClient`] applies bulk operations (invalidate, refetch, reset, remove, cancel)
//!   across filtered subsets of the cache and merges per-query options with client defaults.
//! - [`GarbageCollector`] periodically evicts inactive queries past their retention window.
//!
//! ## Concurrency
//!
//! Every transition of a query's state happens under that query's lock, so transitions for a
//! given key are totally ordered. The in-flight fetch runs as a spawned task, and callers share
//! its outcome through a [`Shared`](futures::future::Shared) channel. Dropping a caller's future
//! does not cancel the fetch; the fetch is aborted only through [`Query::cancel`],
//! [`Query::reset`], removal from the cache, or when the last observer unsubscribes while the
//! fetch is outstanding.
//!
//! Cache events and observer notifications are delivered after the transition is committed and
//! the lock is released, so a listener reading the cache sees the post-mutation state.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gc;
pub mod key;
pub mod logging;
pub mod observer;
pub mod options;
pub mod query;
pub mod reporting;
pub mod retry;
pub mod state;
mod utils;

pub use cache::{CacheEvent, CacheSubscription, QueryCache, QueryHash};
pub use client::{QueryClient, QueryFilter, QueryType, RefetchHandle, RefetchSummary, RefetchType};
pub use error::QueryError;
pub use gc::GarbageCollector;
pub use key::QueryKey;
pub use observer::{ObserverHandle, ObserverId, QueryObserver, Subscription};
pub use options::{DefaultOptions, QueryOptions, RefetchTrigger, ReportOnError};
pub use query::{AnyQuery, Query, QueryFn, query_fn};
pub use reporting::{ErrorReporter, SentryReporter};
pub use retry::{RetryBudget, RetryDelay, RetryPolicy};
pub use state::{FetchStatus, QueryState, QueryStatus, StateSummary};
