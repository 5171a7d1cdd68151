use std::sync::Arc;

use parking_lot::Mutex;
use querycache::{DefaultOptions, QueryClient, QueryError, QueryKey, RetryPolicy};

mod fetching;
mod invalidation;
mod lifecycle;

/// Creates a client that does not retry, and collects escalated errors instead of sending them to
/// Sentry.
pub fn setup_client(
    defaults: DefaultOptions,
) -> (QueryClient, Arc<Mutex<Vec<(QueryKey, QueryError)>>>) {
    querycache_test::setup();

    let reported = Arc::new(Mutex::new(Vec::new()));
    let reporter = {
        let reported = reported.clone();
        move |key: &QueryKey, error: &QueryError| {
            reported.lock().push((key.clone(), error.clone()));
        }
    };
    let defaults = DefaultOptions {
        retry: RetryPolicy::never(),
        ..defaults
    };
    (QueryClient::with_reporter(defaults, Arc::new(reporter)), reported)
}
