use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, de};

use crate::error::QueryError;

/// Upper bound for [`RetryDelay::ExponentialBackoff`].
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;
type RetryDelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// How many times a failed fetch may be retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryBudget {
    /// Never retry.
    Never,
    /// Retry while fewer than `n` failures have been retried.
    Count(u32),
    /// Retry forever, as long as the error is retryable.
    Infinite,
}

impl RetryBudget {
    fn allows(self, failure_count: u32) -> bool {
        match self {
            Self::Never => false,
            Self::Count(n) => failure_count < n,
            Self::Infinite => true,
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::Count(3)
    }
}

/// How long to wait before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// Always wait the same duration.
    Fixed(Duration),
    /// Wait `2^failure_count` seconds, capped at [`MAX_BACKOFF`].
    #[default]
    ExponentialBackoff,
    /// A custom function of the failure count and the error.
    Custom(RetryDelayFn),
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::ExponentialBackoff => f.write_str("ExponentialBackoff"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decides whether, and when, a failed fetch is retried.
///
/// `failure_count` is the number of failures that were already retried before the current one,
/// so it is `0` when the very first attempt fails.
#[derive(Clone, Debug, Default)]
pub struct RetryPolicy {
    pub budget: RetryBudget,
    pub delay: RetryDelay,
    predicate: Option<RetryPredicateFn>,
}

/// Wrapper so the predicate closure can take part in `#[derive(Debug)]`.
#[derive(Clone)]
struct RetryPredicateFn(RetryPredicate);

impl fmt::Debug for RetryPredicateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

impl RetryPolicy {
    pub fn new(budget: RetryBudget, delay: RetryDelay) -> Self {
        Self {
            budget,
            delay,
            predicate: None,
        }
    }

    /// A policy that never retries.
    pub fn never() -> Self {
        Self::new(RetryBudget::Never, RetryDelay::default())
    }

    /// Replaces the built-in retry decision with a custom predicate.
    ///
    /// The predicate is authoritative: neither the budget nor the error classification are
    /// consulted anymore.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(RetryPredicateFn(Arc::new(predicate)));
        self
    }

    /// Replaces the delay computation with a custom function.
    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(u32, &QueryError) -> Duration + Send + Sync + 'static,
    {
        self.delay = RetryDelay::Custom(Arc::new(delay));
        self
    }

    /// Whether the failure that just happened should be retried.
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        if let Some(RetryPredicateFn(predicate)) = &self.predicate {
            return predicate(failure_count, error);
        }
        self.budget.allows(failure_count) && error.is_retryable()
    }

    /// How long to wait before retrying the failure that just happened.
    pub fn delay_for_attempt(&self, failure_count: u32, error: &QueryError) -> Duration {
        match &self.delay {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::ExponentialBackoff => exponential_backoff(failure_count),
            RetryDelay::Custom(delay) => delay(failure_count, error),
        }
    }
}

fn exponential_backoff(failure_count: u32) -> Duration {
    // `powi` saturates to infinity, which `min` then caps
    let exponent = i32::try_from(failure_count).unwrap_or(i32::MAX);
    let secs = 2f64.powi(exponent).min(MAX_BACKOFF.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// The serializable part of a [`RetryPolicy`].
///
/// ```yaml
/// retry: 3           # or `never`, or `infinite`
/// retry_delay: 500ms # omit for exponential backoff
/// ```
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(deserialize_with = "deserialize_retry_budget")]
    pub retry: RetryBudget,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        let delay = match config.retry_delay {
            Some(delay) => RetryDelay::Fixed(delay),
            None => RetryDelay::ExponentialBackoff,
        };
        Self::new(config.retry, delay)
    }
}

#[derive(Debug)]
struct RetryBudgetVisitor;

impl de::Visitor<'_> for RetryBudgetVisitor {
    type Value = RetryBudget;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"a number of retries, or one of the strings "never" or "infinite""#
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u32::try_from(v) {
            Ok(0) => Ok(RetryBudget::Never),
            Ok(n) => Ok(RetryBudget::Count(n)),
            Err(_) => Err(de::Error::invalid_value(de::Unexpected::Unsigned(v), &self)),
        }
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u64::try_from(v) {
            Ok(v) => self.visit_u64(v),
            Err(_) => Err(de::Error::invalid_value(de::Unexpected::Signed(v), &self)),
        }
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(if v {
            RetryBudget::default()
        } else {
            RetryBudget::Never
        })
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "never" => Ok(RetryBudget::Never),
            "infinite" => Ok(RetryBudget::Infinite),
            _ => Err(de::Error::unknown_variant(v, &["never", "infinite"])),
        }
    }
}

fn deserialize_retry_budget<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<RetryBudget, D::Error> {
    deserializer.deserialize_any(RetryBudgetVisitor)
}
