use std::time::Duration;

use querycache::{
    DefaultOptions, FetchStatus, QueryError, QueryFilter, QueryKey, QueryOptions, QueryType,
    RefetchSummary, RefetchTrigger, RefetchType,
};
use querycache_test::{Backend, StateLog};
use serde_json::json;

use crate::setup_client;

fn key(page: u32) -> QueryKey {
    QueryKey::from(json!(["posts", { "page": page }]))
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_preserves_data() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(1u32);

    let query = client
        .query(
            key(1),
            QueryOptions::default().stale_time(Duration::from_secs(3600)),
            backend.producer(),
        )
        .unwrap();
    query.fetch().await.unwrap();
    assert!(!query.is_stale());

    let handle = client.invalidate_queries(&QueryFilter::exact(key(1)), RefetchType::None);
    assert!(handle.is_empty());

    let state = query.state();
    assert!(state.is_invalidated);
    assert_eq!(state.data, Some(1));
    assert!(query.is_stale());
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetch_types() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(3600),
        ..Default::default()
    });
    let backend = Backend::new(0u32).with_latency(Duration::from_millis(20));

    let active = client
        .query(key(1), QueryOptions::default(), backend.producer())
        .unwrap();
    let inactive = client
        .query(key(2), QueryOptions::default(), backend.producer())
        .unwrap();
    active.fetch().await.unwrap();
    inactive.fetch().await.unwrap();
    let _log = StateLog::observe(&active);
    assert_eq!(backend.accesses(), 2);

    let prefix = QueryFilter::prefix(QueryKey::from(json!(["posts"])));

    backend.set_value(1);
    let summary = client
        .invalidate_queries(&prefix, RefetchType::Active)
        .await;
    assert_eq!(summary, RefetchSummary { succeeded: 1, failed: 0 });
    assert_eq!(active.data(), Some(1));
    assert!(!active.state().is_invalidated);
    assert_eq!(inactive.data(), Some(0));
    assert!(inactive.state().is_invalidated);

    backend.set_value(2);
    let summary = client
        .invalidate_queries(&prefix, RefetchType::Inactive)
        .await;
    assert_eq!(summary.total(), 1);
    assert_eq!(active.data(), Some(1));
    assert_eq!(inactive.data(), Some(2));

    backend.set_value(3);
    let summary = client.invalidate_queries(&prefix, RefetchType::All).await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(active.data(), Some(3));
    assert_eq!(inactive.data(), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_during_fetch() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(30),
        ..Default::default()
    });
    let backend = Backend::new("v1".to_owned()).with_latency(Duration::from_millis(100));

    let query = client
        .query(QueryKey::from("doc"), QueryOptions::default(), backend.producer())
        .unwrap();
    let first = query.fetch();

    tokio::time::sleep(Duration::from_millis(10)).await;
    backend.set_value("v2".to_owned());
    let summary = client
        .invalidate_queries(&QueryFilter::all(), RefetchType::All)
        .await;

    // the running fetch settles with data from before the invalidation
    assert_eq!(first.await.as_deref(), Ok("v1"));
    assert_eq!(summary, RefetchSummary { succeeded: 1, failed: 0 });
    assert_eq!(query.data().as_deref(), Some("v2"));
    assert!(!query.state().is_invalidated);
    assert!(!query.is_stale());
    assert_eq!(backend.accesses(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_started_before_invalidate_settles_stale() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(30),
        ..Default::default()
    });
    let backend = Backend::new(1u32).with_latency(Duration::from_millis(100));

    let query = client
        .query(QueryKey::from("doc"), QueryOptions::default(), backend.producer())
        .unwrap();
    let fetch = query.fetch();
    query.invalidate();
    assert_eq!(fetch.await, Ok(1));

    let state = query.state();
    assert_eq!(state.data, Some(1));
    assert!(state.is_invalidated);
    assert!(query.is_stale());

    // a fetch that starts afterwards clears it
    query.fetch().await.unwrap();
    assert!(!query.state().is_invalidated);
    assert_eq!(backend.accesses(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_queries_refetch_on_activation() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(3600),
        ..Default::default()
    });
    let backend = Backend::new("old".to_owned());

    let lazy = client
        .query(
            QueryKey::from("lazy"),
            QueryOptions::default().refetch_trigger(RefetchTrigger::Never),
            backend.producer(),
        )
        .unwrap();
    let eager = client
        .query(QueryKey::from("eager"), QueryOptions::default(), backend.producer())
        .unwrap();
    lazy.fetch().await.unwrap();
    eager.fetch().await.unwrap();
    backend.accesses();

    client
        .invalidate_queries(&QueryFilter::all(), RefetchType::None)
        .await;
    backend.set_value("new".to_owned());

    let _lazy = StateLog::observe(&lazy);
    let _eager = StateLog::observe(&eager);
    // let the activation fetch finish
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(backend.accesses(), 1);
    assert_eq!(lazy.data().as_deref(), Some("old"));
    assert!(lazy.state().is_invalidated);
    assert_eq!(eager.data().as_deref(), Some("new"));
}

#[tokio::test(start_paused = true)]
async fn test_refetch_queries_ignores_staleness() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(3600),
        ..Default::default()
    });
    let backend = Backend::new(1u32);

    for page in 0..3 {
        client
            .query(key(page), QueryOptions::default(), backend.producer())
            .unwrap();
    }
    client
        .query(
            QueryKey::from("disabled"),
            QueryOptions::default().enabled(false),
            backend.producer(),
        )
        .unwrap();

    let handle = client.refetch_queries(&QueryFilter::all());
    assert_eq!(handle.len(), 3);
    assert_eq!(handle.await.succeeded, 3);

    let handle = client.refetch_queries(&QueryFilter::all().stale(false));
    assert_eq!(handle.await.succeeded, 3);
    assert_eq!(backend.accesses(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_last_observer_cancels_fetch() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(1u32).with_latency(Duration::from_secs(10));

    let query = client
        .query(QueryKey::from("slow"), QueryOptions::default(), backend.producer())
        .unwrap();

    let first = StateLog::observe(&query);
    let second = StateLog::observe(&query);
    assert!(query.is_fetching());
    let fetch = query.fetch();

    drop(first);
    assert!(query.is_fetching());
    assert_eq!(query.active_count(), 1);

    drop(second);
    assert!(!query.is_fetching());
    assert_eq!(query.active_count(), 0);
    assert_eq!(fetch.await, Err(QueryError::Cancelled));

    let state = query.state();
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert!(state.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_a_caller_does_not_cancel() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(1u32).with_latency(Duration::from_secs(1));

    let query = client
        .query(QueryKey::from("shared"), QueryOptions::default(), backend.producer())
        .unwrap();

    let dropped = query.fetch();
    let kept = query.fetch();
    drop(dropped);

    assert_eq!(kept.await, Ok(1));
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_and_remove_queries() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(1u32).with_latency(Duration::from_secs(10));

    let queries: Vec<_> = (0..4)
        .map(|page| {
            client
                .query(key(page), QueryOptions::default(), backend.producer())
                .unwrap()
        })
        .collect();
    let fetches: Vec<_> = queries.iter().map(|query| query.fetch()).collect();
    assert_eq!(client.is_fetching(&QueryFilter::all()), 4);

    let first_two = QueryFilter::all().predicate(|query| {
        query.key().value()[1]["page"]
            .as_u64()
            .is_some_and(|page| page < 2)
    });
    assert_eq!(client.cancel_queries(&first_two), 2);
    assert_eq!(client.is_fetching(&QueryFilter::all()), 2);
    // nothing left to cancel
    assert_eq!(client.cancel_queries(&first_two), 0);

    assert_eq!(client.remove_queries(Some(&QueryFilter::exact(key(2)))), 1);
    assert_eq!(client.is_fetching(&QueryFilter::all()), 1);

    let results = futures::future::join_all(fetches).await;
    assert_eq!(
        results,
        vec![
            Err(QueryError::Cancelled),
            Err(QueryError::Cancelled),
            Err(QueryError::Cancelled),
            Ok(1),
        ]
    );
    assert_eq!(client.cache().len(), 3);
    assert_eq!(
        client.remove_queries(Some(&QueryFilter::all().query_type(QueryType::Inactive))),
        3
    );
}
