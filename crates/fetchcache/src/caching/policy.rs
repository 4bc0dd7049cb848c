use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-call configuration of how long a value lives and how it is fetched.
///
/// `stale_time` is always clamped to `cache_time`, so an entry turns stale no later than it
/// expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Total validity of a fetched value. Past this, the value is never served again.
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,

    /// Age after which a value is stale: still servable, but due for a refresh.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,

    /// Whether successfully fetched values are written through to the persistent store.
    pub persistent: bool,

    /// Serve stale values immediately and refresh them in the background.
    ///
    /// When disabled, a stale value is treated like a miss and the caller waits for the refresh.
    pub stale_while_revalidate: bool,

    /// Whether failed fetches are retried with exponential backoff.
    pub retry: bool,

    /// Upper bound on the number of fetch attempts per refresh, including the first one.
    pub max_retries: u32,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(5 * 60),
            stale_time: Duration::from_secs(60),
            persistent: false,
            stale_while_revalidate: true,
            retry: true,
            max_retries: 3,
        }
    }
}

impl CachePolicy {
    /// Creates a policy where values stay fresh for their whole `cache_time`.
    pub fn new(cache_time: Duration) -> Self {
        Self {
            cache_time,
            stale_time: cache_time,
            ..Default::default()
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Enables retries, bounding the total number of attempts to `max_retries`.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.retry = true;
        self.max_retries = max_retries;
        self
    }

    pub fn without_retries(mut self) -> Self {
        self.retry = false;
        self
    }

    /// The stale time actually in effect, which never exceeds the cache time.
    pub fn effective_stale_time(&self) -> Duration {
        self.stale_time.min(self.cache_time)
    }

    /// The number of times the fetch function is invoked at most for a single refresh.
    pub fn max_attempts(&self) -> u32 {
        if self.retry {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}
