use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::entry::{CacheEntry, EntryStore};
use super::inflight::{InFlightRegistry, SharedFetch};
use super::invalidation::{Invalidation, PendingInvalidations};
use super::persistent::{PersistWriter, PersistentStore};
use super::{CacheError, CachePolicy, FetchResult, Fetcher, KeyPattern};

/// The outcome of a cache lookup.
///
/// A lookup can carry a value and an error at the same time: when refreshing a stale value fails,
/// the stale value is still returned alongside the error.
#[derive(Debug)]
pub struct Lookup<V> {
    /// The cached or freshly fetched value.
    pub value: Option<Arc<V>>,
    /// The error of the fetch this lookup waited for, if it failed.
    pub error: Option<CacheError>,
    /// Whether `value` is past its stale time.
    pub is_stale: bool,
    /// Whether a fetch for the key was running when the lookup returned.
    pub is_loading: bool,
}

impl<V> Clone for Lookup<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            error: self.error.clone(),
            is_stale: self.is_stale,
            is_loading: self.is_loading,
        }
    }
}

impl<V> Default for Lookup<V> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            is_stale: false,
            is_loading: false,
        }
    }
}

impl<V> Lookup<V> {
    pub(crate) fn fetched(result: FetchResult<Arc<V>>) -> Self {
        match result {
            Ok(value) => Self {
                value: Some(value),
                ..Default::default()
            },
            Err(error) => Self {
                error: Some(error),
                ..Default::default()
            },
        }
    }

    /// Converts the lookup into a plain result, preferring a value over an error.
    ///
    /// A lookup with neither a value nor an error results in [`CacheError::NotFound`].
    pub fn into_result(self) -> FetchResult<Arc<V>> {
        match (self.value, self.error) {
            (Some(value), _) => Ok(value),
            (None, Some(error)) => Err(error),
            (None, None) => Err(CacheError::NotFound),
        }
    }
}

/// The form in which values are written to the [`PersistentStore`].
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<T> {
    created_at: SystemTime,
    #[serde(with = "humantime_serde")]
    stale_time: Duration,
    #[serde(with = "humantime_serde")]
    cache_time: Duration,
    value: T,
}

#[derive(Debug)]
struct Persistence {
    store: Arc<dyn PersistentStore>,
    writer: PersistWriter,
}

/// Resolves lookups against the in-memory entries, and runs the fetches to refresh them.
///
/// The coordinator is the only writer of the [`EntryStore`] and the [`InFlightRegistry`].
#[derive(Debug)]
pub(crate) struct Coordinator<V> {
    entries: EntryStore<V>,
    in_flight: InFlightRegistry<V>,
    persistence: Option<Persistence>,
    invalidations: PendingInvalidations,
    /// The delay before the first retry, doubled for each retry after that.
    backoff_unit: Duration,
}

impl<V> Coordinator<V> {
    pub fn entries(&self) -> &EntryStore<V> {
        &self.entries
    }

    pub fn in_flight(&self) -> &InFlightRegistry<V> {
        &self.in_flight
    }

    pub fn persist_writer(&self) -> Option<&PersistWriter> {
        self.persistence.as_ref().map(|p| &p.writer)
    }
}

impl<V> Coordinator<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a coordinator, spawning the writer of the persistent store if there is one.
    pub fn new(
        backoff_unit: Duration,
        persistent: Option<Arc<dyn PersistentStore>>,
        max_queue_size: usize,
    ) -> Self {
        let persistence = persistent.map(|store| Persistence {
            writer: PersistWriter::spawn(Arc::clone(&store), max_queue_size),
            store,
        });
        Self {
            entries: EntryStore::new(),
            in_flight: InFlightRegistry::new(),
            persistence,
            invalidations: PendingInvalidations::default(),
            backoff_unit,
        }
    }

    /// Resolves a lookup of `key`.
    ///
    /// - A fresh value is returned as is.
    /// - A stale value is returned right away if `policy` allows serving stale values, and is
    ///   refreshed in the background.
    /// - Otherwise the value is fetched, and the lookup waits for that fetch.
    ///
    /// If waiting for a fetch of a stale key fails, the stale value is returned with the error.
    pub async fn resolve(
        self: &Arc<Self>,
        key: &str,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
    ) -> Lookup<V> {
        metric!(counter("caches.access") += 1);

        let cached = match self.entries.get(key).await {
            Some(entry) => Some(entry),
            None => self.read_through(key, &fetcher, policy).await,
        };

        let Some(entry) = cached else {
            tracing::trace!(key, "Cache miss");
            return Lookup::fetched(self.refresh(key, fetcher, policy).await);
        };

        if !entry.is_stale_at(Instant::now()) {
            tracing::trace!(key, "Cache hit");
            metric!(counter("caches.memory.hit") += 1);
            return Lookup {
                value: Some(Arc::clone(entry.value())),
                is_loading: self.in_flight.contains(key),
                ..Default::default()
            };
        }

        metric!(counter("caches.memory.stale") += 1);

        if policy.stale_while_revalidate {
            tracing::trace!(key, "Serving stale value");
            self.spawn_refresh(key, fetcher, policy, "stale");
            return Lookup {
                value: Some(Arc::clone(entry.value())),
                error: None,
                is_stale: true,
                is_loading: self.in_flight.contains(key),
            };
        }

        tracing::trace!(key, "Refreshing stale value");
        match self.refresh(key, fetcher, policy).await {
            Ok(value) => Lookup::fetched(Ok(value)),
            // A failed fetch never replaces a stored value, which stays servable until it expires.
            Err(error) if !entry.is_expired_at(Instant::now()) => Lookup {
                value: Some(Arc::clone(entry.value())),
                error: Some(error),
                is_stale: true,
                is_loading: false,
            },
            Err(error) => Lookup::fetched(Err(error)),
        }
    }

    /// Fetches `key` and waits for the result, joining a fetch that is already running.
    pub async fn refresh(
        self: &Arc<Self>,
        key: &str,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
    ) -> FetchResult<Arc<V>> {
        let (fetch, _) = self.start_refresh(key, fetcher, policy);
        fetch.await
    }

    /// Starts a fetch of `key` in the background, unless one is already running.
    ///
    /// Errors are logged and otherwise ignored. Returns whether a new fetch was started.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        key: &str,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
        reason: &'static str,
    ) -> bool {
        let (fetch, created) = self.start_refresh(key, fetcher, policy);
        if !created {
            return false;
        }

        tracing::debug!(key, reason, "Spawning background refresh");
        metric!(counter("caches.refresh.background") += 1, "reason" => reason);

        let key = key.to_owned();
        let log_errors = async move {
            if let Err(err) = fetch.await {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(
                    error = dynerr,
                    key = key.as_str(),
                    reason,
                    "Background refresh failed"
                );
            }
        };
        tokio::spawn(log_errors.bind_hub(Hub::new_from_top(Hub::current())));
        true
    }

    fn start_refresh(
        self: &Arc<Self>,
        key: &str,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
    ) -> (SharedFetch<V>, bool) {
        let this = Arc::clone(self);
        let owned_key = key.to_owned();
        self.in_flight.get_or_create(key, move || async move {
            this.fetch_and_store(owned_key, fetcher, policy).await
        })
    }

    /// Runs a fetch with retries and writes its result.
    ///
    /// This runs inside of the in-flight slot of `key`, so the entry is written before the slot is
    /// released.
    async fn fetch_and_store(
        &self,
        key: String,
        fetcher: Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
    ) -> FetchResult<Arc<V>> {
        let value = Arc::new(self.fetch_with_retry(&key, &*fetcher, policy).await?);
        self.store(key, Arc::clone(&value), policy, Some(fetcher)).await;
        Ok(value)
    }

    /// Invokes `fetcher` until it succeeds or runs out of attempts.
    ///
    /// The delay before retry `n` (counting from zero) is `backoff_unit * 2^n`.
    async fn fetch_with_retry(
        &self,
        key: &str,
        fetcher: &dyn Fetcher<V>,
        policy: CachePolicy,
    ) -> FetchResult<V> {
        let max_attempts = policy.max_attempts();
        let mut attempts = 0;
        loop {
            metric!(counter("caches.fetch") += 1);
            let err = match fetcher.fetch().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;

            if attempts >= max_attempts {
                metric!(counter("caches.fetch.error") += 1);
                tracing::debug!(key, attempts, error = %format!("{err:#}"), "Fetch failed");
                return Err(CacheError::fetch_failed(attempts, &err));
            }

            let backoff = self
                .backoff_unit
                .saturating_mul(2u32.saturating_pow(attempts - 1));
            metric!(counter("caches.fetch.retry") += 1);
            tracing::debug!(
                key,
                attempts,
                ?backoff,
                error = %format!("{err:#}"),
                "Fetch failed, retrying",
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Writes `value` to the in-memory entries, and queues a write to the persistent store if
    /// `policy` asks for it.
    pub async fn store(
        &self,
        key: String,
        value: Arc<V>,
        policy: CachePolicy,
        fetcher: Option<Arc<dyn Fetcher<V>>>,
    ) {
        if policy.persistent {
            self.persist(&key, &value, policy);
        }
        let entry = CacheEntry::new(key, value, policy, fetcher, Instant::now());
        self.entries.set(entry).await;
    }

    fn persist(&self, key: &str, value: &V, policy: CachePolicy) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let record = PersistedEntry {
            created_at: SystemTime::now(),
            stale_time: policy.effective_stale_time(),
            cache_time: policy.cache_time,
            value,
        };
        match serde_json::to_vec(&record) {
            Ok(bytes) => {
                metric!(counter("caches.persistent.store") += 1);
                persistence.writer.store(key, bytes, policy.cache_time);
            }
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, key, "Failed to serialize cache value");
            }
        }
    }

    /// Seeds the in-memory entries with a value from the persistent store.
    ///
    /// The seeded entry keeps the deadlines it was written with, so it is subject to the same
    /// freshness checks as any other entry.
    async fn read_through(
        &self,
        key: &str,
        fetcher: &Arc<dyn Fetcher<V>>,
        policy: CachePolicy,
    ) -> Option<CacheEntry<V>> {
        if !policy.persistent {
            return None;
        }
        let persistence = self.persistence.as_ref()?;

        let epoch = self.invalidations.epoch();
        if self.invalidations.covers(key) {
            tracing::trace!(key, "Skipping persistent store during invalidation");
            return None;
        }

        let bytes = match persistence.store.get(key).await {
            Ok(bytes) => bytes?,
            Err(err) => {
                let dynerr: &dyn std::error::Error = err.as_ref();
                tracing::error!(error = dynerr, key, "Failed to read from persistent store");
                return None;
            }
        };
        let record: PersistedEntry<V> = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, key, "Failed to deserialize persisted value");
                return None;
            }
        };

        let age = SystemTime::now()
            .duration_since(record.created_at)
            .unwrap_or_default();
        if age >= record.cache_time {
            return None;
        }
        let now = Instant::now();
        let created_at = now.checked_sub(age).unwrap_or(now);

        let seeded_policy = CachePolicy {
            cache_time: record.cache_time,
            stale_time: record.stale_time,
            ..policy
        };
        let value = Arc::new(record.value);
        let entry = CacheEntry::new(
            key.to_owned(),
            Arc::clone(&value),
            seeded_policy,
            Some(Arc::clone(fetcher)),
            created_at,
        );
        let stored = self.entries.set_if_absent(entry).await;
        if !Arc::ptr_eq(stored.value(), &value) {
            return Some(stored);
        }

        // An invalidation that started while the record was read may have missed the seeded
        // entry. The record it read is on its way out, so it must not be served.
        if self.invalidations.epoch() != epoch {
            tracing::trace!(key, "Invalidated while reading from persistent store");
            self.entries
                .remove_if(key, |entry| Arc::ptr_eq(entry.value(), &value))
                .await;
            return None;
        }

        metric!(counter("caches.persistent.hit") += 1);
        tracing::trace!(key, ?age, "Seeded from persistent store");
        Some(stored)
    }

    /// Drops the value held for `key` from memory and the persistent store.
    ///
    /// Returns the removed in-memory entry. Lookups of `key` do not read through to the
    /// persistent store until the record is deleted.
    pub async fn invalidate(&self, key: &str) -> Option<CacheEntry<V>> {
        let _pending = self.invalidations.begin(Invalidation::Key(key.to_owned()));
        let removed = self.entries.remove(key).await;
        if let Some(persistence) = &self.persistence {
            persistence.writer.delete(key).await;
        }
        removed
    }

    /// Drops all values whose key matches `pattern`.
    ///
    /// Returns the number of values removed from memory and from the persistent store.
    pub async fn invalidate_matching(&self, pattern: &KeyPattern) -> (usize, usize) {
        let _pending = self
            .invalidations
            .begin(Invalidation::Matching(pattern.clone()));
        let removed = self
            .entries
            .delete_matching(|key| pattern.matches(key))
            .await;
        let mut persisted = 0;
        if let Some(persistence) = &self.persistence {
            persisted = persistence.writer.delete_matching(pattern.clone()).await;
        }
        (removed, persisted)
    }

    /// Drops all values, in memory and in the persistent store.
    pub async fn clear(&self) {
        let _pending = self.invalidations.begin(Invalidation::All);
        self.entries.clear();
        if let Some(persistence) = &self.persistence {
            persistence.writer.clear().await;
        }
    }

    /// Starts a background refresh for every stale entry that is not expired yet.
    ///
    /// Returns the number of refreshes started.
    pub fn revalidate_stale(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let mut started = 0;
        for entry in self.entries.snapshot() {
            if !entry.is_stale_at(now) || entry.is_expired_at(now) {
                continue;
            }
            let Some(fetcher) = entry.fetcher() else {
                continue;
            };
            if self.spawn_refresh(entry.key(), Arc::clone(fetcher), *entry.policy(), "activity") {
                started += 1;
            }
        }
        started
    }
}
