use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::coordinator::{Coordinator, Lookup};
use super::persistent::{FilesystemStore, PersistentStore};
use super::{ActivitySignal, CacheError, CachePolicy, FetchResult, Fetcher, KeyPattern};
use crate::config::{CacheConfig, Config, default_max_queue_size};

/// Values that can be held by a [`Cache`].
///
/// Values need to be serializable so they can be written to a [`PersistentStore`].
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A snapshot of the size of a [`Cache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// The number of values held in memory, including expired ones that were not reclaimed yet.
    pub entries: usize,
    /// The number of fetches currently running.
    pub in_flight: usize,
}

struct CacheInner<V> {
    coordinator: Arc<Coordinator<V>>,
    default_policy: CachePolicy,
    signal: ActivitySignal,
    closed: AtomicBool,
    /// Background tasks owned by the cache, aborted when it is closed.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<V> CacheInner<V> {
    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl<V> Drop for CacheInner<V> {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// A key-addressed cache in front of async fetches.
///
/// Cloning a [`Cache`] is cheap and yields another handle to the same cache. All background tasks
/// of the cache are spawned on the tokio runtime it was created in.
pub struct Cache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", self.inner.coordinator.entries())
            .field("in_flight", self.inner.coordinator.in_flight())
            .field("default_policy", &self.inner.default_policy)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl<V: CacheValue> Cache<V> {
    /// Creates a new cache, writing persistent values to `persistent` if given.
    ///
    /// This spawns the background tasks of the cache, so it must be called from within a tokio
    /// runtime.
    pub fn new(config: &CacheConfig, persistent: Option<Arc<dyn PersistentStore>>) -> Self {
        let max_queue_size = config
            .persistent
            .as_ref()
            .map_or_else(default_max_queue_size, |p| p.max_queue_size);
        let coordinator = Arc::new(Coordinator::new(
            config.retry_backoff,
            persistent,
            max_queue_size,
        ));

        let signal = ActivitySignal::new();
        let mut tasks = vec![signal.spawn_listener(Arc::downgrade(&coordinator))];
        if let Some(interval) = config.sweep_interval {
            tasks.push(spawn_sweeper(Arc::downgrade(&coordinator), interval));
        }

        Self {
            inner: Arc::new(CacheInner {
                coordinator,
                default_policy: config.default_policy,
                signal,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(tasks),
            }),
        }
    }

    /// Creates a cache from the service configuration, persisting values to the filesystem if a
    /// persistent store is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let persistent = match &config.cache.persistent {
            Some(persistent) => {
                std::fs::create_dir_all(&persistent.path)
                    .context("failed to create persistent cache directory")?;
                let store: Arc<dyn PersistentStore> =
                    Arc::new(FilesystemStore::new(&persistent.path));
                Some(store)
            }
            None => None,
        };
        Ok(Self::new(&config.cache, persistent))
    }

    fn coordinator(&self) -> &Arc<Coordinator<V>> {
        &self.inner.coordinator
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    /// The policy used for writes that do not specify their own.
    pub fn default_policy(&self) -> CachePolicy {
        self.inner.default_policy
    }

    /// Looks up `key`, using `fetcher` to obtain a value if none is fresh.
    ///
    /// A fresh value is returned immediately. A stale value is returned immediately as well if the
    /// policy allows serving stale values, in which case it is refreshed in the background.
    /// Otherwise this waits for a fetch, which is shared with all concurrent lookups of the same
    /// key.
    ///
    /// The `fetcher` is remembered with the value and reused for refreshes which are not
    /// triggered by a lookup, like [`invalidate`](Self::invalidate) or the activity signal.
    pub async fn get_or_fetch<F>(&self, key: &str, fetcher: F, policy: CachePolicy) -> Lookup<V>
    where
        F: Fetcher<V>,
    {
        if self.is_closed() {
            return Lookup::fetched(Err(CacheError::Closed));
        }
        self.coordinator()
            .resolve(key, Arc::new(fetcher), policy)
            .await
    }

    /// Returns the value held for `key` without ever fetching.
    pub async fn get(&self, key: &str) -> Option<Lookup<V>> {
        let entry = self.coordinator().entries().get(key).await?;
        Some(Lookup {
            value: Some(Arc::clone(entry.value())),
            error: None,
            is_stale: entry.is_stale_at(Instant::now()),
            is_loading: self.coordinator().in_flight().contains(key),
        })
    }

    /// Drops the value held for `key` and fetches it again.
    ///
    /// The value is removed from memory and from the persistent store before the fetch starts, so
    /// the previous value is never returned again. The fetch uses the fetcher and policy the value
    /// was stored with. If the key has no known fetcher, it is only removed.
    pub async fn invalidate(&self, key: &str) -> Lookup<V> {
        if self.is_closed() {
            return Lookup::fetched(Err(CacheError::Closed));
        }
        metric!(counter("caches.invalidate") += 1);

        let Some(entry) = self.coordinator().invalidate(key).await else {
            tracing::debug!(key, "Invalidated unknown key");
            return Lookup::default();
        };
        let Some(fetcher) = entry.fetcher() else {
            tracing::debug!(key, "Invalidated key without fetcher");
            return Lookup::default();
        };

        let result = self
            .coordinator()
            .refresh(key, Arc::clone(fetcher), *entry.policy())
            .await;
        Lookup::fetched(result)
    }

    /// Writes a locally authored `value` for `key` without fetching.
    ///
    /// The value keeps the policy and fetcher of the value it replaces, or uses the default policy
    /// if there is none. It starts out fresh.
    pub async fn mutate(&self, key: &str, value: V) -> FetchResult<Arc<V>> {
        let existing = self.coordinator().entries().get(key).await;
        let (policy, fetcher) = match &existing {
            Some(entry) => (*entry.policy(), entry.fetcher().cloned()),
            None => (self.inner.default_policy, None),
        };
        self.write(key, value, policy, fetcher).await
    }

    /// Writes a locally authored `value` for `key` with an explicit `policy`.
    pub async fn mutate_with(
        &self,
        key: &str,
        value: V,
        policy: CachePolicy,
    ) -> FetchResult<Arc<V>> {
        let fetcher = self
            .coordinator()
            .entries()
            .get(key)
            .await
            .and_then(|entry| entry.fetcher().cloned());
        self.write(key, value, policy, fetcher).await
    }

    async fn write(
        &self,
        key: &str,
        value: V,
        policy: CachePolicy,
        fetcher: Option<Arc<dyn Fetcher<V>>>,
    ) -> FetchResult<Arc<V>> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        metric!(counter("caches.mutate") += 1);
        let value = Arc::new(value);
        self.coordinator()
            .store(key.to_owned(), Arc::clone(&value), policy, fetcher)
            .await;
        Ok(value)
    }

    /// Refreshes all stale values in the background.
    ///
    /// Returns the number of refreshes started. Keys that are already being fetched are joined
    /// instead, and not counted.
    pub fn on_activity_signal(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.coordinator().revalidate_stale()
    }

    /// A handle the host application can fire instead of calling
    /// [`on_activity_signal`](Self::on_activity_signal) itself.
    pub fn activity_signal(&self) -> ActivitySignal {
        self.inner.signal.clone()
    }

    /// Drops all values whose key matches `pattern`, in memory and in the persistent store.
    ///
    /// Returns the number of values dropped from memory.
    ///
    /// ```no_run
    /// # async fn example(cache: fetchcache::Cache<Vec<u32>>) {
    /// // a new post was created, so all pages of the listing are outdated
    /// cache.invalidate_matching("posts:").await;
    /// # }
    /// ```
    pub async fn invalidate_matching(&self, pattern: impl Into<KeyPattern>) -> usize {
        let pattern = pattern.into();
        let (removed, persisted) = self.coordinator().invalidate_matching(&pattern).await;

        tracing::debug!(%pattern, removed, persisted, "Invalidated matching keys");
        metric!(counter("caches.invalidate") += removed as i64, "pattern" => "true");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let stats = CacheStats {
            entries: self.coordinator().entries().len(),
            in_flight: self.coordinator().in_flight().len(),
        };
        metric!(gauge("caches.entries") = stats.entries as u64);
        metric!(gauge("caches.in_flight") = stats.in_flight as u64);
        stats
    }

    /// Fetches `key` in the background, unless a value is already held for it.
    ///
    /// Failures are logged and otherwise ignored. Returns whether a fetch was started.
    pub async fn preload<F>(&self, key: &str, fetcher: F, policy: CachePolicy) -> bool
    where
        F: Fetcher<V>,
    {
        if self.is_closed() {
            return false;
        }
        if self.coordinator().entries().get(key).await.is_some() {
            return false;
        }
        self.coordinator()
            .spawn_refresh(key, Arc::new(fetcher), policy, "preload")
    }

    /// Drops all values, in memory and in the persistent store.
    pub async fn clear(&self) {
        self.coordinator().clear().await;
    }

    /// Closes the cache.
    ///
    /// This stops all background tasks of the cache, waits for queued writes to the persistent
    /// store, and drops all values held in memory. Fetches that are already running complete, but
    /// lookups made after closing fail with [`CacheError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.abort_tasks();
        if let Some(writer) = self.coordinator().persist_writer() {
            writer.flush().await;
        }
        self.coordinator().entries().clear();
        tracing::debug!("Cache closed");
    }
}

/// Spawns the task periodically reclaiming the memory of expired entries.
fn spawn_sweeper<V: CacheValue>(
    coordinator: Weak<Coordinator<V>>,
    interval: Duration,
) -> JoinHandle<()> {
    let sweeper = async move {
        loop {
            tokio::time::sleep(interval).await;
            let Some(coordinator) = coordinator.upgrade() else {
                break;
            };
            let removed = coordinator.entries().sweep().await;
            if removed > 0 {
                tracing::trace!(removed, "Swept expired entries");
            }
            metric!(counter("caches.sweep") += removed as i64);
        }
    };
    tokio::spawn(sweeper.bind_hub(Hub::new_from_top(Hub::current())))
}
