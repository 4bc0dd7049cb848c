use std::io::Write;
use std::time::Duration;

use fetchcache::config::Config;
use fetchcache::{Cache, CachePolicy, CacheKeyBuilder};
use fetchcache_test::ScriptedFetch;
use serde::{Deserialize, Serialize};

use crate::utils::persistent_config;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Listing {
    id: u32,
    city: String,
    price: u32,
}

fn listing(id: u32, city: &str, price: u32) -> Listing {
    Listing {
        id,
        city: city.into(),
        price,
    }
}

#[tokio::test]
async fn test_survives_restart() {
    fetchcache_test::setup();
    let dir = fetchcache_test::tempdir();
    let config = persistent_config(dir.path());
    let policy = CachePolicy::new(Duration::from_secs(300)).with_persistent(true);

    let key = CacheKeyBuilder::new("listings")
        .param("city", "Lisbon")
        .param("max_price", 1500)
        .build();
    let fetch = ScriptedFetch::new().then_ok(vec![
        listing(1, "Lisbon", 1200),
        listing(2, "Lisbon", 1450),
    ]);

    let cache = Cache::<Vec<Listing>>::from_config(&config).unwrap();
    let lookup = cache.get_or_fetch(&key, fetch.fetcher(), policy).await;
    assert_eq!(lookup.value.unwrap().len(), 2);
    cache.close().await;

    let restarted = Cache::<Vec<Listing>>::from_config(&config).unwrap();
    let lookup = restarted.get_or_fetch(&key, fetch.fetcher(), policy).await;
    assert_eq!(
        *lookup.value.unwrap(),
        vec![listing(1, "Lisbon", 1200), listing(2, "Lisbon", 1450)]
    );
    assert!(!lookup.is_stale);
    assert_eq!(fetch.calls(), 1);
}

#[tokio::test]
async fn test_invalidated_values_do_not_come_back() {
    fetchcache_test::setup();
    let dir = fetchcache_test::tempdir();
    let config = persistent_config(dir.path());
    let policy = CachePolicy::new(Duration::from_secs(300)).with_persistent(true);

    let fetch = ScriptedFetch::new()
        .then_ok(vec![listing(1, "Porto", 900)])
        .then_ok(vec![listing(1, "Porto", 950)]);

    let cache = Cache::<Vec<Listing>>::from_config(&config).unwrap();
    cache.get_or_fetch("listings:city=Porto", fetch.fetcher(), policy).await;

    let lookup = cache.invalidate("listings:city=Porto").await;
    assert_eq!(lookup.value.unwrap()[0].price, 950);
    cache.close().await;

    // the refetched value replaced the persisted one
    let restarted = Cache::<Vec<Listing>>::from_config(&config).unwrap();
    let lookup = restarted
        .get_or_fetch("listings:city=Porto", fetch.fetcher(), policy)
        .await;
    assert_eq!(lookup.value.unwrap()[0].price, 950);
    assert_eq!(fetch.calls(), 2);
}

#[tokio::test]
async fn test_invalidate_matching_clears_persisted_family() {
    fetchcache_test::setup();
    let dir = fetchcache_test::tempdir();
    let config = persistent_config(dir.path());
    let policy = CachePolicy::new(Duration::from_secs(300)).with_persistent(true);

    let cache = Cache::<u32>::from_config(&config).unwrap();
    cache.mutate_with("posts:page=1", 1, policy).await.unwrap();
    cache.mutate_with("posts:page=2", 2, policy).await.unwrap();
    cache.mutate_with("user:42", 42, policy).await.unwrap();

    assert_eq!(cache.invalidate_matching("posts:").await, 2);
    cache.close().await;

    let restarted = Cache::<u32>::from_config(&config).unwrap();
    let missing = ScriptedFetch::new().then_err("offline");
    let policy = policy.without_retries();

    let lookup = restarted
        .get_or_fetch("posts:page=1", missing.fetcher(), policy)
        .await;
    assert!(lookup.value.is_none());
    let lookup = restarted
        .get_or_fetch("user:42", missing.fetcher(), policy)
        .await;
    assert_eq!(*lookup.value.unwrap(), 42);
    assert_eq!(missing.calls(), 1);
}

#[tokio::test]
async fn test_config_file() {
    fetchcache_test::setup();
    let dir = fetchcache_test::tempdir();
    let cache_dir = dir.path().join("persisted");

    let mut file = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
    writeln!(
        file,
        "cache:\n  default_policy:\n    cache_time: 2m\n    persistent: true\n  sweep_interval: null\n  persistent:\n    path: {}",
        cache_dir.display()
    )
    .unwrap();

    let config = Config::get(Some(file.path())).unwrap();
    assert_eq!(
        config.cache.default_policy.cache_time,
        Duration::from_secs(120)
    );

    let cache = Cache::<String>::from_config(&config).unwrap();
    assert!(cache_dir.is_dir());

    // locally written values use the configured default policy
    cache.mutate("user:42", "Ada".into()).await.unwrap();
    cache.close().await;

    let restarted = Cache::<String>::from_config(&config).unwrap();
    let fetch = ScriptedFetch::new().then_ok("Grace".to_string());
    let lookup = restarted
        .get_or_fetch("user:42", fetch.fetcher(), config.cache.default_policy)
        .await;
    assert_eq!(*lookup.value.unwrap(), "Ada");
    assert_eq!(fetch.calls(), 0);
}
