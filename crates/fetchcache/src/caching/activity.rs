use std::sync::{Arc, Weak};

use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::coordinator::Coordinator;

/// A handle for the host application to signal renewed activity, like regaining focus.
///
/// Firing the signal makes the cache refresh all of its stale entries in the background. Signals
/// fired while a previous one is still being handled are merged into one.
#[derive(Debug, Clone, Default)]
pub struct ActivitySignal {
    notify: Arc<Notify>,
}

impl ActivitySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn fired(&self) {
        self.notify.notified().await
    }

    /// Spawns the task reacting to this signal.
    ///
    /// The task ends once the coordinator is gone.
    pub(crate) fn spawn_listener<V>(&self, coordinator: Weak<Coordinator<V>>) -> JoinHandle<()>
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let signal = self.clone();
        let listener = async move {
            loop {
                signal.fired().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let started = coordinator.revalidate_stale();
                tracing::debug!(started, "Handled activity signal");
            }
        };
        tokio::spawn(listener.bind_hub(Hub::new_from_top(Hub::current())))
    }
}
