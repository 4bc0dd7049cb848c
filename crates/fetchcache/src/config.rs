use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::caching::CachePolicy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "fetchcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where and how cached values are persisted across restarts.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct PersistentConfig {
    /// Directory holding one file per persisted key.
    pub path: PathBuf,

    /// The number of queued up writes to the persistent store.
    ///
    /// Writes are not critical for the operation of the cache. If the queue is full, further
    /// writes are dropped until the store has caught up.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

pub(crate) fn default_max_queue_size() -> usize {
    400
}

/// Tuning of the in-memory cache and its background tasks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// The policy used for writes which do not specify their own, such as
    /// [`Cache::mutate`](crate::caching::Cache::mutate) on a key that was never fetched.
    pub default_policy: CachePolicy,

    /// The base unit of the exponential retry backoff.
    ///
    /// The delay before retry `n` (counting from zero) is `retry_backoff * 2^n`.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Interval of the background sweep that drops expired entries from memory.
    ///
    /// Reads never return expired entries regardless of this setting. Set to `null` to disable.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,

    /// The persistent backing store. No values are persisted when this is absent.
    pub persistent: Option<PersistentConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_policy: CachePolicy::default(),
            retry_backoff: Duration::from_secs(1),
            sweep_interval: Some(Duration::from_secs(60)),
            persistent: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Configuration of the cache itself.
    pub cache: CacheConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache, CacheConfig::default());
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "fetchcache");
    }

    #[test]
    fn test_cache_config() {
        // Setting individual policy fields keeps the defaults of the others.
        let yaml = r#"
            cache:
              default_policy:
                cache_time: 10m
                persistent: true
              retry_backoff: 250ms
              persistent:
                path: /tmp/fetchcache
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let policy = cfg.cache.default_policy;
        assert_eq!(policy.cache_time, Duration::from_secs(600));
        assert!(policy.persistent);
        assert_eq!(policy.stale_time, CachePolicy::default().stale_time);
        assert_eq!(policy.max_retries, CachePolicy::default().max_retries);

        assert_eq!(cfg.cache.retry_backoff, Duration::from_millis(250));
        assert_eq!(
            cfg.cache.sweep_interval,
            CacheConfig::default().sweep_interval
        );

        let persistent = cfg.cache.persistent.unwrap();
        assert_eq!(persistent.path, PathBuf::from("/tmp/fetchcache"));
        assert_eq!(persistent.max_queue_size, 400);
    }

    #[test]
    fn test_disabling_sweep() {
        let yaml = r#"
            cache:
              sweep_interval: null
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.sweep_interval, None);
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
