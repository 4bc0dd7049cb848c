use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::KeyPattern;
use crate::utils::defer::{DeferGuard, defer};

/// The keys an invalidation applies to.
#[derive(Debug, Clone)]
pub(crate) enum Invalidation {
    Key(String),
    Matching(KeyPattern),
    All,
}

impl Invalidation {
    fn covers(&self, key: &str) -> bool {
        match self {
            Invalidation::Key(invalidated) => invalidated == key,
            Invalidation::Matching(pattern) => pattern.matches(key),
            Invalidation::All => true,
        }
    }
}

type Pending = Arc<Mutex<Vec<(u64, Invalidation)>>>;

fn lock(pending: &Mutex<Vec<(u64, Invalidation)>>) -> MutexGuard<'_, Vec<(u64, Invalidation)>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks invalidations whose deletes from the persistent store have not completed yet.
///
/// Reads from the persistent store consult this before putting a value back into memory: a
/// record that is about to be deleted must never be seeded. Every invalidation bumps the epoch,
/// so a read that started before an invalidation can detect it after the fact.
#[derive(Debug, Default)]
pub(crate) struct PendingInvalidations {
    epoch: AtomicU64,
    pending: Pending,
}

impl PendingInvalidations {
    /// Registers an invalidation, which stays pending until the returned guard is dropped.
    pub fn begin(&self, invalidation: Invalidation) -> DeferGuard<impl FnOnce() + Send + use<>> {
        let id = {
            let mut pending = lock(&self.pending);
            let id = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            pending.push((id, invalidation));
            id
        };

        let pending = Arc::clone(&self.pending);
        defer(move || lock(&pending).retain(|(other, _)| *other != id))
    }

    /// The number of invalidations started so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a pending invalidation applies to `key`.
    pub fn covers(&self, key: &str) -> bool {
        lock(&self.pending)
            .iter()
            .any(|(_, invalidation)| invalidation.covers(key))
    }
}
