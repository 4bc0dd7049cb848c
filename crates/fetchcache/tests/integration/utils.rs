use std::path::Path;
use std::time::Duration;

use fetchcache::config::{Config, PersistentConfig};

/// A configuration persisting to `dir`, without a sweeper.
pub fn persistent_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cache.sweep_interval = None;
    config.cache.retry_backoff = Duration::from_millis(10);
    config.cache.persistent = Some(PersistentConfig {
        path: dir.join("cache"),
        max_queue_size: 16,
    });
    config
}
