use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fetchcache::config::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable `sentry`.
    #[arg(long)]
    sentry: bool,

    /// Enable `tracing`.
    #[arg(long)]
    tracing: bool,

    /// Enable `metrics`.
    #[arg(long)]
    metrics: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::load(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let logging_config = logging::Config {
        backtraces: true,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: No other threads have been spawned yet.
    let mut logging_guard = unsafe { logging::init(logging_config)? };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
