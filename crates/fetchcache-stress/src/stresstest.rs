use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use fetchcache::config::Config;
use fetchcache::{Cache, CacheStats};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Payload, WorkloadsConfig};

struct WorkloadResult {
    concurrency: usize,
    lookups: DDSketch,
    errors: usize,
    stale: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Cache::<Payload>::from_config(&config)?;
    let workloads: Vec<_> = workloads.workloads.into_iter().map(Arc::new).collect();

    // warmup: run each workload once to make sure the cache is not entirely cold
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                workload.lookup(&cache).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let lookups = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let stale = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            let activity = workload.activity_interval.map(|interval| {
                let signal = cache.activity_signal();
                tokio::spawn(async move {
                    let first_tick = deadline - duration + interval;
                    let mut ticker = tokio::time::interval_at(first_tick, interval);
                    while ticker.tick().await < deadline {
                        signal.fire();
                    }
                })
            });

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let lookups = Arc::clone(&lookups);
                        let errors = Arc::clone(&errors);
                        let stale = Arc::clone(&stale);
                        let lookup_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let lookup = workload.lookup(&cache).await;

                            transaction.finish();

                            if lookup.error.is_some() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }
                            if lookup.is_stale {
                                stale.fetch_add(1, Ordering::Relaxed);
                            }
                            lookups
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(lookup_start.elapsed().as_secs_f64());

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            if let Some(activity) = activity {
                activity.abort();
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let lookups: DDSketch = {
                let mut lookups = lookups.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut lookups)
            };
            WorkloadResult {
                concurrency,
                lookups,
                errors: errors.load(Ordering::Relaxed),
                stale: stale.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let WorkloadResult {
            concurrency,
            lookups,
            errors,
            stale,
        } = task?;

        let ops = lookups.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} lookups, {ops_ps:.2} ops/s");
        println!("  errors: {errors}; stale: {stale}");
        if ops == 0 {
            continue;
        }

        let quantile = |q: f64| {
            Duration::from_secs_f64(lookups.quantile(q).ok().flatten().unwrap_or(0.0))
        };
        let avg = Duration::from_secs_f64(lookups.sum().unwrap_or(0.0) / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let CacheStats { entries, in_flight } = cache.stats();
    println!();
    println!("Cache: {entries} entries, {in_flight} fetches in flight");

    cache.close().await;

    Ok(())
}
