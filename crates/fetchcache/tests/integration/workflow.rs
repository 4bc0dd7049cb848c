use std::sync::Arc;
use std::time::Duration;

use fetchcache::config::CacheConfig;
use fetchcache::{Cache, CacheError, CacheKeyBuilder, CachePolicy, CacheStats};
use fetchcache_test::ScriptedFetch;

fn cache<V: fetchcache::CacheValue>() -> Cache<V> {
    let config = CacheConfig {
        sweep_interval: None,
        retry_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    Cache::new(&config, None)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalescing_across_tasks() {
    fetchcache_test::setup();
    let cache = cache::<Vec<u32>>();
    let fetch = ScriptedFetch::with_latency(Duration::from_millis(100)).then_ok(vec![1, 2, 3]);
    let policy = CachePolicy::new(Duration::from_secs(60));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let cache = cache.clone();
            let fetcher = fetch.fetcher();
            tokio::spawn(async move {
                cache
                    .get_or_fetch("posts:page=1", fetcher, policy)
                    .await
                    .into_result()
            })
        })
        .collect();

    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }

    assert_eq!(fetch.calls(), 1);
    assert!(values.iter().all(|value| Arc::ptr_eq(value, &values[0])));
    assert_eq!(
        cache.stats(),
        CacheStats {
            entries: 1,
            in_flight: 0
        }
    );
}

#[tokio::test]
async fn test_independent_keys_fetch_independently() {
    fetchcache_test::setup();
    let cache = cache::<u32>();
    let policy = CachePolicy::new(Duration::from_secs(60));

    let page = |n: u32| CacheKeyBuilder::new("posts").param("page", n).build();
    let first = ScriptedFetch::new().then_ok(1);
    let second = ScriptedFetch::new().then_ok(2);

    let (first_page, second_page) = (page(1), page(2));
    let (a, b) = tokio::join!(
        cache.get_or_fetch(&first_page, first.fetcher(), policy),
        cache.get_or_fetch(&second_page, second.fetcher(), policy),
    );

    assert_eq!(*a.value.unwrap(), 1);
    assert_eq!(*b.value.unwrap(), 2);
    assert_eq!((first.calls(), second.calls()), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_focus_regained() {
    fetchcache_test::setup();
    let cache = cache::<String>();
    let policy =
        CachePolicy::new(Duration::from_secs(3600)).with_stale_time(Duration::from_secs(30));
    let fetch = ScriptedFetch::new()
        .then_ok("3 unread".to_string())
        .then_ok("5 unread".to_string());

    cache
        .get_or_fetch("notifications:user=42", fetch.fetcher(), policy)
        .await;

    // the host application wires its focus event to the signal
    let on_focus = cache.activity_signal();

    tokio::time::sleep(Duration::from_secs(45)).await;
    on_focus.fire();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let lookup = cache.get("notifications:user=42").await.unwrap();
    assert_eq!(*lookup.value.unwrap(), "5 unread");
    assert!(!lookup.is_stale);
    assert_eq!(fetch.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_error_next_to_stale_value() {
    fetchcache_test::setup();
    let cache = cache::<u32>();
    let policy = CachePolicy::new(Duration::from_secs(60))
        .with_stale_time(Duration::from_secs(10))
        .with_stale_while_revalidate(false)
        .with_retries(2);
    let fetch = ScriptedFetch::new().then_ok(1).then_err("503 Service Unavailable");

    cache.get_or_fetch("user:42", fetch.fetcher(), policy).await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    let lookup = cache.get_or_fetch("user:42", fetch.fetcher(), policy).await;
    assert_eq!(fetch.calls(), 3);
    assert_eq!(*lookup.value.clone().unwrap(), 1);
    assert!(lookup.is_stale);
    assert_eq!(
        lookup.error,
        Some(CacheError::FetchFailed {
            attempts: 2,
            message: "503 Service Unavailable".into()
        })
    );

    // past its expiry, the value is gone and only the error remains
    tokio::time::sleep(Duration::from_secs(60)).await;
    let lookup = cache.get_or_fetch("user:42", fetch.fetcher(), policy).await;
    assert!(lookup.value.is_none());
    assert!(lookup.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reclaims_memory() {
    fetchcache_test::setup();
    let config = CacheConfig {
        sweep_interval: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let cache = Cache::<u32>::new(&config, None);
    let policy = CachePolicy::new(Duration::from_secs(5));

    cache.mutate_with("user:1", 1, policy).await.unwrap();
    cache
        .mutate_with("user:2", 2, CachePolicy::new(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(cache.stats().entries, 2);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(cache.stats().entries, 1);
}
