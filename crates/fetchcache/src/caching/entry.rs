use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use tokio::time::Instant;

use super::{CachePolicy, Fetcher};

/// A value held by the [`EntryStore`], together with its freshness deadlines.
pub struct CacheEntry<V> {
    key: String,
    value: Arc<V>,
    created_at: Instant,
    stale_at: Instant,
    expires_at: Instant,
    /// The policy the value was written with.
    policy: CachePolicy,
    /// How to fetch this key again, for refreshes that are not triggered by a caller.
    fetcher: Option<Arc<dyn Fetcher<V>>>,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
            created_at: self.created_at,
            stale_at: self.stale_at,
            expires_at: self.expires_at,
            policy: self.policy,
            fetcher: self.fetcher.clone(),
        }
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("stale_at", &self.stale_at)
            .field("expires_at", &self.expires_at)
            .field("policy", &self.policy)
            .field("has_fetcher", &self.fetcher.is_some())
            .finish_non_exhaustive()
    }
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(
        key: String,
        value: Arc<V>,
        policy: CachePolicy,
        fetcher: Option<Arc<dyn Fetcher<V>>>,
        created_at: Instant,
    ) -> Self {
        Self {
            key,
            value,
            created_at,
            stale_at: created_at + policy.effective_stale_time(),
            expires_at: created_at + policy.cache_time,
            policy,
            fetcher,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Arc<V> {
        &self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn stale_at(&self) -> Instant {
        self.stale_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub(crate) fn fetcher(&self) -> Option<&Arc<dyn Fetcher<V>>> {
        self.fetcher.as_ref()
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        now > self.stale_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`CacheEntry`] `expires_at` as the
/// explicit expiration time.
///
/// This only lets moka reclaim memory on its own schedule. Lookups check `expires_at` themselves
/// and never depend on moka having evicted anything.
struct EntryExpiration;

fn remaining<V>(entry: &CacheEntry<V>) -> Option<Duration> {
    Some(entry.expires_at.saturating_duration_since(Instant::now()))
}

impl<V> moka::Expiry<String, CacheEntry<V>> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        remaining(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        remaining(value)
    }
}

/// The in-memory table of cached values.
///
/// The table is unbounded: entries leave it only by expiring or being deleted.
pub struct EntryStore<V> {
    entries: moka::future::Cache<String, CacheEntry<V>>,
}

impl<V> fmt::Debug for EntryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl<V: Send + Sync + 'static> Default for EntryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> EntryStore<V> {
    pub fn new() -> Self {
        let entries = moka::future::Cache::builder()
            .name("fetchcache-entries")
            .expire_after(EntryExpiration)
            .build();
        Self { entries }
    }

    /// Returns the entry for `key`, unless it is absent or expired.
    ///
    /// Expired entries are evicted on the way.
    pub async fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.get(key).await?;
        if entry.is_expired_at(Instant::now()) {
            self.evict_if_expired(key).await;
            return None;
        }
        Some(entry)
    }

    /// Inserts `entry`, replacing whatever was stored for its key.
    pub async fn set(&self, entry: CacheEntry<V>) {
        self.entries.insert(entry.key.clone(), entry).await;
    }

    /// Inserts `entry` unless a valid entry is already stored for its key.
    ///
    /// Returns the entry that is stored afterwards.
    pub async fn set_if_absent(&self, entry: CacheEntry<V>) -> CacheEntry<V> {
        let key = entry.key.clone();
        let candidate = entry.clone();
        let result = self
            .entries
            .entry_by_ref(key.as_str())
            .and_compute_with(move |existing| {
                let op = match existing {
                    Some(existing) if !existing.value().is_expired_at(Instant::now()) => Op::Nop,
                    _ => Op::Put(candidate),
                };
                std::future::ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(stored)
            | CompResult::ReplacedWith(stored)
            | CompResult::Unchanged(stored)
            | CompResult::Removed(stored) => stored.into_value(),
            CompResult::StillNone(_) => entry,
        }
    }

    /// Removes the entry for `key`, returning it even if it already expired.
    pub async fn remove(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries.remove(key).await
    }

    /// Removes all entries whose key matches `predicate`, returning how many were removed.
    pub async fn delete_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| predicate(key))
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key.as_str()).await.is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Drops all expired entries, returning how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        for key in keys {
            if self.evict_if_expired(&key).await {
                removed += 1;
            }
        }
        self.entries.run_pending_tasks().await;
        removed
    }

    /// Removes the entry for `key` only if it is still expired.
    ///
    /// A fresh value written concurrently for the same key is left alone.
    async fn evict_if_expired(&self, key: &str) -> bool {
        self.remove_if(key, |entry| entry.is_expired_at(Instant::now()))
            .await
    }

    /// Removes the entry for `key` if `predicate` holds for it, atomically with respect to other
    /// conditional writes of the same key.
    pub async fn remove_if<P>(&self, key: &str, predicate: P) -> bool
    where
        P: FnOnce(&CacheEntry<V>) -> bool,
    {
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) if predicate(entry.value()) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Removed(_))
    }

    /// Returns a copy of all stored entries, including expired ones that were not evicted yet.
    pub fn snapshot(&self) -> Vec<CacheEntry<V>> {
        self.entries.iter().map(|(_, entry)| entry).collect()
    }

    /// The number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}
