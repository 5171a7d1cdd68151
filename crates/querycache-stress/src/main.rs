use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use querycache::config::Config;

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

    /// Report errors to a local Sentry sink.
    #[arg(long)]
    sentry: bool,

    /// Run the full tracing machinery, writing into the void.
    #[arg(long)]
    tracing: bool,

    /// Send metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            querycache::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        backtraces: true,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
    };
    // SAFETY: No other threads are running yet.
    let guard = unsafe { logging::init(logging_config, &config)? };

    // without the local sinks, report wherever the config points to
    let _sentry = match cli.sentry {
        true => None,
        false => querycache::reporting::init_sentry(&config),
    };
    if !cli.metrics {
        querycache::metrics::init(&config.metrics).context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        if let Some(http_sink) = guard.http_sink {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }
        tracing::info!(workloads = workloads.workloads.len(), "starting stresstest");

        perform_stresstest(config, workloads, cli.duration).await
    })
}
