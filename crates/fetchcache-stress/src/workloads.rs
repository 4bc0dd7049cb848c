use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fetchcache::{Cache, CacheKeyBuilder, CachePolicy, Lookup};
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A simulated response body.
pub type Payload = Vec<u8>;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        serde_yaml::from_reader(file).context("failed to parse workloads YAML")
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of lookups in flight at any time.
    pub concurrency: usize,
    /// The resource name of all keys of this workload.
    pub resource: String,
    /// The number of distinct keys lookups are spread over.
    pub keys: usize,
    /// How long each simulated fetch takes.
    #[serde(with = "humantime_serde", default)]
    pub latency: Duration,
    /// The probability of a simulated fetch to fail.
    #[serde(default)]
    pub failure_rate: f64,
    /// The size of each fetched payload in bytes.
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default)]
    pub policy: CachePolicy,
    /// When set, the activity signal is fired at this interval for the duration of the test.
    #[serde(with = "humantime_serde", default)]
    pub activity_interval: Option<Duration>,
}

fn default_payload_size() -> usize {
    1024
}

impl Workload {
    /// Looks up a random key of this workload, simulating a fetch on miss.
    pub async fn lookup(&self, cache: &Cache<Payload>) -> Lookup<Payload> {
        let id = rand::rng().random_range(0..self.keys.max(1));
        let key = CacheKeyBuilder::new(&self.resource).param("id", id).build();

        let latency = self.latency;
        let failure_rate = self.failure_rate;
        let payload_size = self.payload_size;
        let fetcher = move || simulate_fetch(latency, failure_rate, payload_size);

        cache.get_or_fetch(&key, fetcher, self.policy).await
    }
}

fn simulate_fetch(
    latency: Duration,
    failure_rate: f64,
    payload_size: usize,
) -> BoxFuture<'static, Result<Payload>> {
    // decided upfront, as the thread-local rng must not be held across an await point
    let fails = rand::rng().random_bool(failure_rate.clamp(0.0, 1.0));

    Box::pin(async move {
        tokio::time::sleep(latency).await;
        if fails {
            anyhow::bail!("simulated fetch failure");
        }
        Ok(vec![0; payload_size])
    })
}
