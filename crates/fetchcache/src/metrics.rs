//! Reporting of cache metrics to statsd.
//!
//! Metrics are emitted through the [`metric!`](crate::metric) macro, which does nothing until
//! [`configure_statsd`] was called.
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cadence::prelude::*;
use cadence::{Counter, Gauge, Metric, MetricBuilder, StatsdClient, UdpMetricSink};

static CLIENT: OnceLock<MetricsClient> = OnceLock::new();

/// A statsd client that attaches a fixed set of tags to every metric it sends.
#[derive(Debug)]
pub struct MetricsClient {
    statsd: StatsdClient,
    global_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    pub fn new(statsd: StatsdClient, global_tags: BTreeMap<String, String>) -> Self {
        Self {
            statsd,
            global_tags,
        }
    }

    pub fn count<'a>(&'a self, key: &'a str, value: i64) -> MetricBuilder<'a, 'a, Counter> {
        self.tagged(self.statsd.count_with_tags(key, value))
    }

    pub fn gauge<'a>(&'a self, key: &'a str, value: u64) -> MetricBuilder<'a, 'a, Gauge> {
        self.tagged(self.statsd.gauge_with_tags(key, value))
    }

    fn tagged<'a, T>(&'a self, mut builder: MetricBuilder<'a, 'a, T>) -> MetricBuilder<'a, 'a, T>
    where
        T: Metric + From<String>,
    {
        for (tag, value) in &self.global_tags {
            builder = builder.with_tag(tag, value);
        }
        builder
    }
}

/// Reports all metrics to the statsd server at `host`, prefixing their names with `prefix`.
///
/// Only the first call has an effect.
pub fn configure_statsd<A: ToSocketAddrs>(
    prefix: &str,
    host: A,
    global_tags: BTreeMap<String, String>,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind statsd socket")?;
    socket
        .set_nonblocking(true)
        .context("failed to configure statsd socket")?;
    let sink = UdpMetricSink::from(host, socket).context("failed to create statsd sink")?;

    let client = MetricsClient::new(StatsdClient::from_sink(prefix, sink), global_tags);
    match CLIENT.set(client) {
        Ok(()) => tracing::info!(prefix, "Reporting metrics to statsd"),
        Err(_) => tracing::warn!("Metrics were already configured"),
    }
    Ok(())
}

/// Calls `f` with the configured client, if any.
#[inline(always)]
pub fn with_client<F>(f: F)
where
    F: FnOnce(&MetricsClient),
{
    if let Some(client) = CLIENT.get() {
        f(client);
    }
}

/// Emits a counter or gauge, with optional `"tag" => value` pairs.
///
/// ```
/// # use fetchcache::metric;
/// metric!(counter("caches.access") += 1);
/// metric!(gauge("caches.entries") = 12, "cache" => "posts");
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            client.count($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
    (gauge($id:expr) = $value:expr $(, $k:expr => $v:expr)* $(,)?) => {
        $crate::metrics::with_client(|client| {
            client.gauge($id, $value)$(.with_tag($k, $v))*.send();
        })
    };
}

#[cfg(test)]
mod tests {
    use cadence::SpyMetricSink;

    use super::*;

    #[test]
    fn test_global_tags() {
        let (sent, sink) = SpyMetricSink::new();
        let tags = BTreeMap::from([("host".to_owned(), "test".to_owned())]);
        let client = MetricsClient::new(StatsdClient::from_sink("fetchcache", sink), tags);

        client
            .count("caches.access", 1)
            .with_tag("reason", "stale")
            .send();
        let metric = String::from_utf8(sent.try_recv().unwrap()).unwrap();
        assert!(metric.starts_with("fetchcache.caches.access:1|c"), "{metric}");
        assert!(metric.contains("host:test"), "{metric}");
        assert!(metric.contains("reason:stale"), "{metric}");
    }

    #[test]
    fn test_unconfigured_is_noop() {
        metric!(counter("caches.access") += 1, "reason" => "stale");
        metric!(gauge("caches.entries") = 3);
    }
}
