use std::time::Duration;

use futures::future::join_all;
use querycache::{
    DefaultOptions, FetchStatus, QueryError, QueryKey, QueryOptions, QueryStatus, RetryBudget,
    RetryDelay, RetryPolicy,
};
use querycache_test::{Backend, StateLog};

use crate::setup_client;

#[tokio::test(start_paused = true)]
async fn test_posts_scenario() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new("v1".to_owned()).with_latency(Duration::from_millis(100));

    let query = client
        .query(
            QueryKey::from("posts"),
            QueryOptions::default().stale_time(Duration::from_secs(30)),
            backend.producer(),
        )
        .unwrap();

    let results = join_all([query.fetch(), query.fetch(), query.fetch()]).await;
    for result in results {
        assert_eq!(result.unwrap(), "v1");
    }
    assert_eq!(backend.accesses(), 1);

    backend.set_value("v2".to_owned());
    assert_eq!(query.fetch().await.unwrap(), "v2");
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_are_shared() {
    let (client, reported) = setup_client(DefaultOptions::default());
    let backend = Backend::new(0u32).with_latency(Duration::from_millis(10));
    backend.respond(Err(QueryError::NotFound));

    let query = client
        .query(QueryKey::from("missing"), QueryOptions::default(), backend.producer())
        .unwrap();

    let results = join_all((0..8).map(|_| query.fetch())).await;
    assert!(results.iter().all(|result| result == &Err(QueryError::NotFound)));
    assert_eq!(backend.accesses(), 1);

    // escalation is off by default
    assert!(reported.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_different_keys_fetch_independently() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(1u32).with_latency(Duration::from_millis(50));

    let queries: Vec<_> = (0..3)
        .map(|id| {
            client
                .query(
                    QueryKey::new(&("user", id)).unwrap(),
                    QueryOptions::default(),
                    backend.producer(),
                )
                .unwrap()
        })
        .collect();

    let results = join_all(queries.iter().map(|query| query.fetch())).await;
    assert!(results.into_iter().all(|result| result == Ok(1)));
    assert_eq!(
        backend.all_hits(),
        vec![
            (r#"["user",0]"#.to_owned(), 1),
            (r#"["user",1]"#.to_owned(), 1),
            (r#"["user",2]"#.to_owned(), 1),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_backoff() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(7u32);
    backend.fail_times(2, QueryError::Timeout);

    let query = client
        .query(
            QueryKey::from("flaky"),
            QueryOptions::default().retry(RetryPolicy::default()),
            backend.producer(),
        )
        .unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(query.fetch().await, Ok(7));
    // waited 1s and 2s between the three attempts
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    assert_eq!(backend.accesses(), 3);

    let state = query.state();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_failure_count, 0);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_settle_into_error() {
    let (client, reported) = setup_client(DefaultOptions::default());
    let backend = Backend::new(7u32);
    backend.fail_times(3, QueryError::Network("connection reset".into()));

    let retry = RetryPolicy::new(
        RetryBudget::Count(2),
        RetryDelay::Fixed(Duration::from_millis(500)),
    );
    let query = client
        .query(
            QueryKey::from("down"),
            QueryOptions::default()
                .retry(retry)
                .report_on_error(querycache::ReportOnError::Always),
            backend.producer(),
        )
        .unwrap();

    let error = query.fetch().await.unwrap_err();
    assert_eq!(error, QueryError::Network("connection reset".into()));
    assert_eq!(backend.accesses(), 3);

    let state = query.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.fetch_failure_count, 3);
    assert_eq!(state.error_update_count, 1);

    let reported = reported.lock();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, QueryKey::from("down"));

    // not fatal, the next fetch tries again
    drop(reported);
    backend.respond(Ok(8));
    assert_eq!(query.fetch().await, Ok(8));
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_errors_fail_immediately() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(0u32);
    backend.respond(Err(QueryError::Decoding("expected a number".into())));

    let query = client
        .query(
            QueryKey::from("broken"),
            QueryOptions::default().retry(RetryPolicy::default()),
            backend.producer(),
        )
        .unwrap();

    assert!(matches!(query.fetch().await, Err(QueryError::Decoding(_))));
    assert_eq!(backend.accesses(), 1);
    assert_eq!(query.state().fetch_failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_refetch_keeps_data() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new("first".to_owned());

    let query = client
        .query(QueryKey::from("posts"), QueryOptions::default(), backend.producer())
        .unwrap();
    query.fetch().await.unwrap();

    let log = StateLog::subscribe(&query);
    backend.respond(Err(QueryError::Server {
        status: 503,
        message: "unavailable".into(),
    }));
    assert!(query.refetch().await.is_err());

    let state = query.state();
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.is_some());
    assert_eq!(state.data.as_deref(), Some("first"));

    let states = log.take();
    assert_eq!(states.len(), 2);
    // the refetch keeps the settled status while it runs
    assert_eq!(states[0].status, QueryStatus::Success);
    assert_eq!(states[0].fetch_status, FetchStatus::Fetching);
    assert!(states[0].has_data);
    assert_eq!(states[1].status, QueryStatus::Error);
    assert!(states[1].has_data);
}

#[tokio::test]
async fn test_disabled_query() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(3u32);

    let query = client
        .query(
            QueryKey::from("lazy"),
            QueryOptions::default().enabled(false),
            backend.producer(),
        )
        .unwrap();

    assert_eq!(query.fetch().await, Err(QueryError::Disabled));
    let _log = StateLog::observe(&query);
    assert_eq!(backend.accesses(), 0);
    assert_eq!(query.state().status, QueryStatus::Pending);

    // manual refetches go through
    assert_eq!(query.refetch().await, Ok(3));
    assert_eq!(query.fetch().await, Ok(3));
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_pauses_fetches() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(5u32);
    let query = client
        .query(QueryKey::from("feed"), QueryOptions::default(), backend.producer())
        .unwrap();

    client.set_online(false);
    let fetch = tokio::spawn(query.fetch());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(query.state().fetch_status, FetchStatus::Paused);
    assert_eq!(backend.accesses(), 0);

    client.set_online(true);
    assert_eq!(fetch.await.unwrap(), Ok(5));
    assert_eq!(backend.accesses(), 1);
    assert_eq!(query.state().fetch_status, FetchStatus::Idle);
}
