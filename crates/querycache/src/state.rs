use std::time::Duration;

use tokio::time::Instant;

use crate::error::QueryError;

/// Whether a query has settled, and how.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QueryStatus {
    /// No fetch has completed yet.
    #[default]
    Pending,
    /// The last completed fetch failed.
    Error,
    /// The last completed fetch succeeded.
    Success,
}

/// Whether the producer is currently running for a query.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    /// A fetch is outstanding but waits for connectivity to come back.
    Paused,
}

/// A snapshot of one query's data, error, status and timestamps.
///
/// Snapshots are values: every transition consumes the previous snapshot and returns the next
/// one. The owning [`Query`](crate::Query) applies transitions under its lock, so no two
/// transitions of the same query ever interleave.
#[derive(Clone, Debug)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub data_updated_at: Option<Instant>,
    pub data_update_count: u64,
    pub error: Option<QueryError>,
    pub error_updated_at: Option<Instant>,
    pub error_update_count: u64,
    /// Failed attempts since the last success, including retried ones.
    ///
    /// Starting a new fetch keeps the count, so it adds up across consecutive failed fetches.
    /// Reset by a successful fetch or by writing data.
    pub fetch_failure_count: u32,
    /// The most recent failure of the current or last fetch.
    pub fetch_failure_reason: Option<QueryError>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl<T> QueryState<T> {
    /// Marks the very first fetch of a query as running.
    pub fn start_initial_fetch(self) -> Self {
        debug_assert_eq!(self.status, QueryStatus::Pending);
        Self {
            fetch_status: FetchStatus::Fetching,
            ..self
        }
    }

    /// Marks a fetch as running for a query that has settled before.
    ///
    /// Status, data and error are kept, so consumers keep rendering the last value while the new
    /// one is on its way.
    pub fn start_refetch(self) -> Self {
        debug_assert_ne!(self.status, QueryStatus::Pending);
        Self {
            fetch_status: FetchStatus::Fetching,
            ..self
        }
    }

    /// Picks [`start_initial_fetch`](Self::start_initial_fetch) or
    /// [`start_refetch`](Self::start_refetch) depending on whether the query ever settled.
    pub fn start_fetch(self) -> Self {
        match self.status {
            QueryStatus::Pending => self.start_initial_fetch(),
            QueryStatus::Error | QueryStatus::Success => self.start_refetch(),
        }
    }

    pub fn succeed(self, data: T, now: Instant) -> Self {
        Self {
            data: Some(data),
            data_updated_at: Some(now),
            data_update_count: self.data_update_count + 1,
            error: None,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            is_invalidated: false,
            status: QueryStatus::Success,
            fetch_status: FetchStatus::Idle,
            ..self
        }
    }

    /// Settles a fetch as failed. Previously fetched data is kept.
    pub fn fail(self, error: QueryError, now: Instant) -> Self {
        Self {
            error: Some(error.clone()),
            error_updated_at: Some(now),
            error_update_count: self.error_update_count + 1,
            fetch_failure_count: self.fetch_failure_count + 1,
            fetch_failure_reason: Some(error),
            status: QueryStatus::Error,
            fetch_status: FetchStatus::Idle,
            ..self
        }
    }

    /// Records a failed attempt that is about to be retried.
    ///
    /// Unlike [`fail`](Self::fail), the query keeps fetching and its status does not change.
    pub fn record_failed_attempt(self, error: QueryError) -> Self {
        Self {
            fetch_failure_count: self.fetch_failure_count + 1,
            fetch_failure_reason: Some(error),
            ..self
        }
    }

    /// Marks the data as logically stale without discarding it.
    pub fn invalidate(self) -> Self {
        Self {
            is_invalidated: true,
            ..self
        }
    }

    /// Returns to the empty, pending snapshot.
    pub fn reset(self) -> Self {
        Self::default()
    }

    /// Writes data directly, as if a fetch had succeeded.
    pub fn set_data(self, data: T, now: Instant) -> Self {
        self.succeed(data, now)
    }

    /// Stops an outstanding fetch without settling it.
    pub fn cancel(self) -> Self {
        Self {
            fetch_status: FetchStatus::Idle,
            ..self
        }
    }

    pub fn pause(self) -> Self {
        Self {
            fetch_status: FetchStatus::Paused,
            ..self
        }
    }

    pub fn resume(self) -> Self {
        Self {
            fetch_status: FetchStatus::Fetching,
            ..self
        }
    }

    /// Whether the data should be refetched.
    ///
    /// Invalidated queries and queries without data are always stale. Otherwise the data goes
    /// stale once `stale_time` has passed since it was last updated, so a `stale_time` of zero
    /// makes data stale as soon as it settles.
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        if self.is_invalidated || self.data.is_none() {
            return true;
        }
        match self.data_updated_at {
            Some(updated_at) => now.saturating_duration_since(updated_at) >= stale_time,
            None => true,
        }
    }

    /// The later of the data and error timestamps.
    pub fn last_updated(&self) -> Option<Instant> {
        self.data_updated_at.max(self.error_updated_at)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_status != FetchStatus::Idle
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            has_data: self.data.is_some(),
            data_updated_at: self.data_updated_at,
            data_update_count: self.data_update_count,
            has_error: self.error.is_some(),
            error_updated_at: self.error_updated_at,
            error_update_count: self.error_update_count,
            fetch_failure_count: self.fetch_failure_count,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: self.fetch_status,
        }
    }
}

/// The data-independent part of a [`QueryState`].
///
/// This is what type-erased consumers, like [`QueryFilter`](crate::QueryFilter) predicates or
/// [`RefetchTrigger::WhenCondition`](crate::RefetchTrigger::WhenCondition), get to look at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StateSummary {
    pub has_data: bool,
    pub data_updated_at: Option<Instant>,
    pub data_update_count: u64,
    pub has_error: bool,
    pub error_updated_at: Option<Instant>,
    pub error_update_count: u64,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl StateSummary {
    /// Same rule as [`QueryState::is_stale`].
    pub fn is_stale(&self, now: Instant, stale_time: Duration) -> bool {
        if self.is_invalidated || !self.has_data {
            return true;
        }
        match self.data_updated_at {
            Some(updated_at) => now.saturating_duration_since(updated_at) >= stale_time,
            None => true,
        }
    }
}
