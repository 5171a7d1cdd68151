//! Out-of-band escalation of final fetch failures.
//!
//! Every failure is recorded in the query state regardless. Whether it is *also* handed to an
//! [`ErrorReporter`] is decided per query by [`ReportOnError`](crate::ReportOnError).

use std::fmt;

use crate::config::Config;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Receives final fetch failures that a query decided to escalate.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: &QueryKey, error: &QueryError);
}

impl<F> ErrorReporter for F
where
    F: Fn(&QueryKey, &QueryError) + Send + Sync,
{
    fn report(&self, key: &QueryKey, error: &QueryError) {
        self(key, error)
    }
}

/// Captures escalated errors with Sentry.
///
/// This does nothing unless a Sentry client is bound to the current hub.
#[derive(Clone, Copy, Debug, Default)]
pub struct SentryReporter;

impl ErrorReporter for SentryReporter {
    fn report(&self, key: &QueryKey, error: &QueryError) {
        sentry::with_scope(
            |scope| {
                scope.set_tag("query.error", error.kind());
                scope.set_extra("query.key", key.value().clone());
                scope.set_extra("query.digest", key.short_digest().into());
            },
            || sentry::capture_error(error),
        );
    }
}

/// Binds a Sentry client for the configured DSN.
///
/// Returns `None` when no DSN is configured. Events are only sent while the guard is alive.
pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.clone()?;
    tracing::info!(host = dsn.host(), "reporting query errors to sentry");
    Some(sentry::init(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        ..Default::default()
    }))
}

impl fmt::Debug for dyn ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorReporter")
    }
}
