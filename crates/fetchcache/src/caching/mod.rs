//! # Caching of async fetches
//!
//! This module contains the [`Cache`], which sits in front of arbitrary async fetch functions,
//! together with everything it is built from.
//!
//! ## Resolving a lookup
//!
//! Every value is stored together with two deadlines derived from its [`CachePolicy`]:
//!
//! - `stale_at`, after which the value is still served but is due for a refresh, and
//! - `expires_at`, after which the value is treated as if it was never stored.
//!
//! A [`Cache::get_or_fetch`] goes through the following steps:
//!
//! - First, it looks at the in-memory entries. Expired entries are evicted on the way.
//! - On miss, and if the policy is persistent, it tries to seed the in-memory entries from the
//!   [`PersistentStore`]. A seeded value goes through the same freshness checks as any other.
//! - A fresh value is returned right away.
//! - A stale value is returned right away as well, and a refresh is spawned in the background,
//!   unless the policy disables stale-while-revalidate. In that case, the lookup waits for the
//!   refresh like it would on a miss.
//! - On miss, the lookup waits for a fetch.
//!
//! All fetches, whether waited for or spawned in the background, go through a registry of
//! in-flight fetches. At most one fetch runs per key at any time, and concurrent lookups of the
//! same key share its result. A fetch is retried with exponential backoff as the policy allows.
//!
//! A failed fetch never writes anything. A previously stored value is kept, and stays servable
//! until it expires.
//!
//! ## Persistence
//!
//! Successfully fetched values of persistent policies are queued for writing to the
//! [`PersistentStore`]. Writes are best-effort: they are dropped when the queue is full and
//! failures are only logged. The in-memory entries remain authoritative for the running process.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by a fresh in-memory value.
//! - `caches.memory.stale`: Lookups that found a stale in-memory value.
//! - `caches.persistent.hit`: Values seeded from the persistent store.
//! - `caches.fetch`: Invocations of fetch functions, including retries.
//! - `caches.fetch.retry` / `caches.fetch.error`: Failed attempts that were retried, and fetches
//!   that failed for good.
//! - `caches.refresh.background`: Background refreshes, tagged with the `reason` they were
//!   started for.
//! - `caches.invalidate` / `caches.mutate`: Explicit invalidations and local writes.
//! - `caches.sweep`: Expired entries reclaimed by the periodic sweep.
//! - `caches.entries` / `caches.in_flight`: Gauges, reported when stats are requested.
//! - `caches.persistent.store`, `caches.persistent.store.dropped`, `caches.persistent.write`:
//!   Writes to the persistent store.

mod activity;
mod cache;
mod cache_error;
mod cache_key;
mod coordinator;
mod invalidation;
pub mod entry;
mod fetcher;
pub mod inflight;
pub mod persistent;
mod policy;


pub use activity::ActivitySignal;
pub use cache::{Cache, CacheStats, CacheValue};
pub use cache_error::{CacheError, FetchResult};
pub use cache_key::{CacheKeyBuilder, KeyPattern};
pub use coordinator::Lookup;
pub use fetcher::Fetcher;
pub use persistent::{FilesystemStore, MemoryStore, PersistentStore};
pub use policy::CachePolicy;
