use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::QueryError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::state::StateSummary;

type StateCondition = Arc<dyn Fn(&StateSummary) -> bool + Send + Sync>;
type ErrorCondition = Arc<dyn Fn(&QueryError) -> bool + Send + Sync>;

/// Whether a query refetches when an observer becomes active.
#[derive(Clone, Default)]
pub enum RefetchTrigger {
    Never,
    Always,
    /// Refetch only if the data is stale (or invalidated, or missing).
    #[default]
    IfStale,
    /// Refetch if the condition holds for the current state.
    WhenCondition(StateCondition),
}

impl RefetchTrigger {
    pub fn when<F>(condition: F) -> Self
    where
        F: Fn(&StateSummary) -> bool + Send + Sync + 'static,
    {
        Self::WhenCondition(Arc::new(condition))
    }

    pub(crate) fn should_refetch(&self, summary: &StateSummary, is_stale: bool) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::IfStale => is_stale,
            Self::WhenCondition(condition) => condition(summary),
        }
    }
}

impl fmt::Debug for RefetchTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::IfStale => f.write_str("IfStale"),
            Self::WhenCondition(_) => f.write_str("WhenCondition(..)"),
        }
    }
}

/// Whether a final fetch failure is also forwarded to the [`ErrorReporter`](crate::ErrorReporter).
///
/// This is independent of the failure being recorded in the query state, which always happens.
#[derive(Clone, Default)]
pub enum ReportOnError {
    #[default]
    Never,
    Always,
    WhenCondition(ErrorCondition),
}

impl ReportOnError {
    pub fn when<F>(condition: F) -> Self
    where
        F: Fn(&QueryError) -> bool + Send + Sync + 'static,
    {
        Self::WhenCondition(Arc::new(condition))
    }

    pub(crate) fn should_report(&self, error: &QueryError) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::WhenCondition(condition) => condition(error),
        }
    }
}

impl fmt::Debug for ReportOnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::WhenCondition(_) => f.write_str("WhenCondition(..)"),
        }
    }
}

/// Per-query options. Every field left as `None` inherits the client default.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub enabled: Option<bool>,
    pub refetch_trigger: Option<RefetchTrigger>,
    pub report_on_error: Option<ReportOnError>,
}

impl QueryOptions {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn refetch_trigger(mut self, trigger: RefetchTrigger) -> Self {
        self.refetch_trigger = Some(trigger);
        self
    }

    pub fn report_on_error(mut self, report: ReportOnError) -> Self {
        self.report_on_error = Some(report);
        self
    }

    /// Fills every unset field from `defaults`.
    ///
    /// This happens once, when a query is constructed.
    pub fn resolve(self, defaults: &DefaultOptions) -> DefaultOptions {
        DefaultOptions {
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            retry: self.retry.unwrap_or_else(|| defaults.retry.clone()),
            enabled: self.enabled.unwrap_or(defaults.enabled),
            refetch_trigger: self
                .refetch_trigger
                .unwrap_or_else(|| defaults.refetch_trigger.clone()),
            report_on_error: self
                .report_on_error
                .unwrap_or_else(|| defaults.report_on_error.clone()),
        }
    }
}

/// Fully resolved options.
///
/// A [`QueryClient`](crate::QueryClient) holds one of these as its defaults, and every query
/// holds its own resolved copy.
#[derive(Clone, Debug)]
pub struct DefaultOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub refetch_trigger: RefetchTrigger,
    pub report_on_error: ReportOnError,
}

impl Default for DefaultOptions {
    fn default() -> Self {
        Self {
            // immediately stale
            stale_time: Duration::ZERO,
            gc_time: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            enabled: true,
            refetch_trigger: RefetchTrigger::IfStale,
            report_on_error: ReportOnError::Never,
        }
    }
}

/// How a query reacts to an observer becoming active, as written in configuration files.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RefetchTriggerConfig {
    Never,
    Always,
    #[default]
    IfStale,
}

/// Client-wide query defaults, as written in configuration files.
///
/// Conditions and custom retry functions can only be set in code.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueryDefaultsConfig {
    /// How long fetched data is considered fresh.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,
    /// How long an inactive query is retained before it may be garbage collected.
    #[serde(with = "humantime_serde")]
    pub gc_time: Duration,
    #[serde(flatten)]
    pub retry: RetryConfig,
    pub enabled: bool,
    pub refetch_on_activate: RefetchTriggerConfig,
    /// Forward final fetch failures to the error reporter.
    pub report_on_error: bool,
}

impl Default for QueryDefaultsConfig {
    fn default() -> Self {
        let defaults = DefaultOptions::default();
        Self {
            stale_time: defaults.stale_time,
            gc_time: defaults.gc_time,
            retry: RetryConfig::default(),
            enabled: defaults.enabled,
            refetch_on_activate: RefetchTriggerConfig::IfStale,
            report_on_error: false,
        }
    }
}

impl From<QueryDefaultsConfig> for DefaultOptions {
    fn from(config: QueryDefaultsConfig) -> Self {
        Self {
            stale_time: config.stale_time,
            gc_time: config.gc_time,
            retry: config.retry.into(),
            enabled: config.enabled,
            refetch_trigger: match config.refetch_on_activate {
                RefetchTriggerConfig::Never => RefetchTrigger::Never,
                RefetchTriggerConfig::Always => RefetchTrigger::Always,
                RefetchTriggerConfig::IfStale => RefetchTrigger::IfStale,
            },
            report_on_error: if config.report_on_error {
                ReportOnError::Always
            } else {
                ReportOnError::Never
            },
        }
    }
}
