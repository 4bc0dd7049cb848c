use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use super::{CacheError, FetchResult};
use crate::utils::defer::defer;

/// A handle to a running fetch that any number of callers can await.
///
/// All of them observe the identical result.
pub type SharedFetch<V> = Shared<BoxFuture<'static, FetchResult<Arc<V>>>>;

struct Slot<V> {
    /// Identifies this registration, so that the cleanup of an older fetch for the same key never
    /// removes a newer one.
    generation: u64,
    future: SharedFetch<V>,
}

type Slots<V> = Arc<Mutex<HashMap<String, Slot<V>>>>;

fn lock<V>(slots: &Mutex<HashMap<String, Slot<V>>>) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks the fetches that are currently running, at most one per key.
pub struct InFlightRegistry<V> {
    slots: Slots<V>,
    next_generation: AtomicU64,
}

impl<V> fmt::Debug for InFlightRegistry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = lock(&self.slots);
        let keys: Vec<_> = slots.keys().collect();
        f.debug_struct("InFlightRegistry")
            .field("keys", &keys)
            .finish()
    }
}

impl<V> Default for InFlightRegistry<V> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
            next_generation: AtomicU64::new(0),
        }
    }
}

impl<V: Send + Sync + 'static> InFlightRegistry<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running fetch for `key`, or starts a new one with `start`.
    ///
    /// The second element is `true` if `start` was invoked. Checking for and registering a fetch
    /// happens under a single lock, so `start` runs at most once for concurrent callers.
    ///
    /// The fetch is spawned onto the runtime and keeps running even if every caller drops its
    /// handle. Its slot is removed as soon as the fetch settles, before any of the waiters
    /// observe the result.
    pub fn get_or_create<F, Fut>(&self, key: &str, start: F) -> (SharedFetch<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<Arc<V>>> + Send + 'static,
    {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get(key) {
            return (slot.future.clone(), false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fetch = start();

        let release = {
            let slots = Arc::clone(&self.slots);
            let key = key.to_owned();
            move || {
                let mut slots = lock(&slots);
                if slots
                    .get(&key)
                    .is_some_and(|slot| slot.generation == generation)
                {
                    slots.remove(&key);
                }
            }
        };
        let task = async move {
            // Runs on completion as well as when the fetch panics.
            let _release = defer(release);
            fetch.await
        };
        let handle = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        let future = async move { handle.await.unwrap_or_else(|err| Err(CacheError::from(err))) }
            .boxed()
            .shared();

        slots.insert(
            key.to_owned(),
            Slot {
                generation,
                future: future.clone(),
            },
        );

        (future, true)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.slots).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
