//! A key-addressed cache for async fetches.
//!
//! The entry point is [`Cache`](caching::Cache), which sits in front of arbitrary fetch
//! functions and provides time-bounded freshness, stale-while-revalidate, request coalescing,
//! retries with exponential backoff, invalidation and optional write-through to a
//! [`PersistentStore`](caching::PersistentStore).
//!
//! See the [`caching`] module for a walkthrough of how a lookup is resolved.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;

pub use caching::{
    ActivitySignal, Cache, CacheError, CacheKeyBuilder, CachePolicy, CacheStats, CacheValue,
    Fetcher, FetchResult, KeyPattern, Lookup,
};
