//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the persistent store silently recreates
//!    the directory on its next write, and leaks it. To avoid this, assign it to a variable in the
//!    test function (e.g. `let _cache_dir = fetchcache_test::tempdir()`).
//!
//!  - Fetch functions built from a [`ScriptedFetch`] sleep with [`tokio::time::sleep`], so their
//!    latency follows a paused test clock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fetchcache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetchcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A single scripted result of a fetch.
#[derive(Debug, Clone)]
enum Outcome<T> {
    Ok(T),
    Err(String),
}

struct Script<T> {
    calls: AtomicUsize,
    outcomes: Mutex<VecDeque<Outcome<T>>>,
    /// The outcome repeated once all scripted outcomes were used up.
    last: Mutex<Option<Outcome<T>>>,
    latency: Duration,
}

/// A fetch function replaying a scripted sequence of results, counting its invocations.
///
/// Each invocation consumes the next scripted result. Once the script is used up, the last
/// result is repeated forever.
///
/// ```
/// use fetchcache_test::ScriptedFetch;
///
/// let fetch = ScriptedFetch::new()
///     .then_err("connection reset")
///     .then_ok(vec![1, 2, 3]);
/// let _fetcher = fetch.fetcher();
/// assert_eq!(fetch.calls(), 0);
/// ```
pub struct ScriptedFetch<T> {
    script: Arc<Script<T>>,
}

impl<T> Clone for ScriptedFetch<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T> fmt::Debug for ScriptedFetch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedFetch")
            .field("calls", &self.calls())
            .field("latency", &self.script.latency)
            .finish_non_exhaustive()
    }
}

impl<T> Default for ScriptedFetch<T> {
    fn default() -> Self {
        Self::with_latency(Duration::ZERO)
    }
}

impl<T> ScriptedFetch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty script whose fetches take `latency` to complete.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            script: Arc::new(Script {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(VecDeque::new()),
                last: Mutex::new(None),
                latency,
            }),
        }
    }

    fn push(self, outcome: Outcome<T>) -> Self {
        self.script
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    /// Appends a successful fetch of `value` to the script.
    pub fn then_ok(self, value: T) -> Self {
        self.push(Outcome::Ok(value))
    }

    /// Appends a failed fetch to the script.
    pub fn then_err(self, message: impl Into<String>) -> Self {
        self.push(Outcome::Err(message.into()))
    }

    /// The number of times the fetch function was invoked so far.
    pub fn calls(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

impl<T: Clone + Send + Sync + 'static> ScriptedFetch<T> {
    fn next_outcome(&self) -> Option<Outcome<T>> {
        let mut outcomes = self
            .script
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut last = self.script.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = outcomes.pop_front() {
            *last = Some(outcome);
        }
        last.clone()
    }

    /// Performs one fetch, consuming the next scripted outcome.
    ///
    /// The invocation is counted immediately, not when the returned future completes.
    pub fn fetch(&self) -> BoxFuture<'static, anyhow::Result<T>> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.next_outcome();
        let latency = self.script.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            match outcome {
                Some(Outcome::Ok(value)) => Ok(value),
                Some(Outcome::Err(message)) => Err(anyhow::Error::msg(message)),
                None => Err(anyhow::anyhow!("fetch was not scripted")),
            }
        })
    }

    /// Returns a fetch function sharing this script and its invocation counter.
    pub fn fetcher(
        &self,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync + 'static {
        let this = self.clone();
        move || this.fetch()
    }
}
