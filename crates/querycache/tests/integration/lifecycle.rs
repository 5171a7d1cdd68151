use std::sync::Arc;
use std::time::Duration;

use querycache::config::Config;
use querycache::{
    AnyQuery, CacheEvent, DefaultOptions, GarbageCollector, QueryClient, QueryFilter, QueryKey,
    QueryOptions, QueryStatus, RefetchType,
};
use querycache_test::{Backend, EventLog, StateLog};
use tokio::sync::Barrier;

use crate::setup_client;

#[tokio::test(start_paused = true)]
async fn test_gc_evicts_inactive_queries() {
    let (client, _) = setup_client(DefaultOptions {
        gc_time: Duration::from_secs(60),
        ..Default::default()
    });
    let collector = GarbageCollector::new(Duration::from_secs(10));
    client.mount(&collector);
    let backend = Backend::new(1u32);

    let watched = client
        .query(QueryKey::from("watched"), QueryOptions::default(), backend.producer())
        .unwrap();
    let unwatched = client
        .query(QueryKey::from("unwatched"), QueryOptions::default(), backend.producer())
        .unwrap();
    watched.fetch().await.unwrap();
    unwatched.fetch().await.unwrap();
    let _log = StateLog::observe(&watched);
    // the observer refetched the immediately stale data
    tokio::time::sleep(Duration::from_millis(1)).await;

    tokio::time::sleep(Duration::from_secs(55)).await;
    assert_eq!(client.cache().len(), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.cache().len(), 1);
    assert!(client.cache().contains(watched.hash()));

    // active queries are never collected, regardless of age
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(client.cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_from_config() {
    querycache_test::setup();
    let yaml = r#"
        queries:
          stale_time: 30s
          gc_time: 1m
          retry: never
        gc:
          interval: 5s
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    let client = QueryClient::from_config(&config);

    let collector = client.collector().unwrap();
    assert_eq!(collector.interval(), Duration::from_secs(5));
    assert!(collector.is_running());

    let backend = Backend::new(1u32);
    let value = client
        .fetch_query(QueryKey::from("config"), QueryOptions::default(), backend.producer())
        .await
        .unwrap();
    assert_eq!(value, 1);

    let query = client.cache().get(QueryKey::from("config").hash()).unwrap();
    assert!(!query.is_stale(tokio::time::Instant::now()));
    assert_eq!(query.gc_time(), Duration::from_secs(60));

    tokio::time::sleep(Duration::from_secs(66)).await;
    assert!(client.cache().is_empty());

    let yaml = r#"
        gc:
          enabled: false
    "#;
    let config = Config::from_reader(yaml.as_bytes()).unwrap();
    assert!(QueryClient::from_config(&config).collector().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cache_events() {
    let (client, _) = setup_client(DefaultOptions::default());
    let events = EventLog::new(client.cache());
    let backend = Backend::new(1u32);

    let key = QueryKey::from("events");
    let hash = key.hash().clone();
    let query = client
        .query(key.clone(), QueryOptions::default(), backend.producer())
        .unwrap();
    assert_eq!(events.take(), vec![CacheEvent::Added(hash.clone())]);

    query.fetch().await.unwrap();
    // fetching, then success
    assert_eq!(
        events.take(),
        vec![
            CacheEvent::Updated(hash.clone()),
            CacheEvent::Updated(hash.clone())
        ]
    );

    let handle = client.invalidate_queries(&QueryFilter::all(), RefetchType::None);
    assert!(handle.is_empty());
    assert_eq!(events.take(), vec![CacheEvent::Updated(hash.clone())]);

    client.remove_queries(Some(&QueryFilter::exact(key.clone())));
    assert_eq!(events.take(), vec![CacheEvent::Removed(hash.clone())]);

    // a removed query no longer reports to the cache
    query.set_data(2);
    assert!(events.take().is_empty());

    client
        .query(key, QueryOptions::default(), backend.producer())
        .unwrap();
    client.clear();
    assert_eq!(
        events.take_structural(),
        vec![CacheEvent::Added(hash), CacheEvent::Cleared]
    );
}

#[tokio::test(start_paused = true)]
async fn test_listeners_see_committed_state() {
    let (client, _) = setup_client(DefaultOptions::default());
    let backend = Backend::new(5u32);
    let key = QueryKey::from("committed");

    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let _subscription = client.cache().subscribe({
        let cache = client.cache().clone();
        let seen = seen.clone();
        move |event: &CacheEvent| {
            if let CacheEvent::Updated(hash) = event {
                let query = cache.get(hash).unwrap();
                seen.lock().push(query.summary().status);
            }
        }
    });

    let query = client
        .query(key, QueryOptions::default(), backend.producer())
        .unwrap();
    query.fetch().await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![QueryStatus::Pending, QueryStatus::Success]
    );
}

#[tokio::test]
async fn test_set_and_reset_query_data() {
    let (client, _) = setup_client(DefaultOptions {
        stale_time: Duration::from_secs(60),
        ..Default::default()
    });
    let backend = Backend::new("fetched".to_owned());
    let key = QueryKey::new(&["todos", "1"]).unwrap();

    client
        .query(key.clone(), QueryOptions::default(), backend.producer())
        .unwrap();
    assert!(client.set_query_data(&key, "written".to_owned()));

    // fresh data written by hand is served without a fetch
    let value = client
        .fetch_query(key.clone(), QueryOptions::default(), backend.producer())
        .await
        .unwrap();
    assert_eq!(value, "written");
    assert_eq!(backend.accesses(), 0);

    assert_eq!(client.reset_queries(&QueryFilter::exact(key.clone())), 1);
    let state = client.get_query_state::<String>(&key).unwrap();
    assert_eq!(state.status, QueryStatus::Pending);
    assert!(state.data.is_none());

    let value = client
        .fetch_query(key, QueryOptions::default(), backend.producer())
        .await
        .unwrap();
    assert_eq!(value, "fetched");
    assert_eq!(backend.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_creates_one_query() {
    const TASKS: usize = 16;

    let (client, _) = setup_client(DefaultOptions::default());
    let events = EventLog::new(client.cache());
    let backend = Backend::new(1u32);
    let barrier = Arc::new(Barrier::new(TASKS));

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let client = client.clone();
            let backend = backend.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let query = client
                    .query(QueryKey::from("contended"), QueryOptions::default(), backend.producer())
                    .unwrap();
                AnyQuery::query_id(&query)
            })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let stored = client.cache().get(QueryKey::from("contended").hash()).unwrap();
    assert_eq!(stored.query_id(), ids[0]);
    assert_eq!(client.cache().len(), 1);
    assert_eq!(
        events.take_structural(),
        [CacheEvent::Added(QueryKey::from("contended").hash().clone())]
    );
}
