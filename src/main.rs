//! Profiler Demo
//!
//! Runs a synthetic workload against the aggregating profiler and flushes
//! reports through the logging sink on a selective-rate schedule.
//!
//! ```text
//! ┌────────────┐   start/stop   ┌──────────┐   tick   ┌───────────────────────┐
//! │  workers   │ ─────────────▶ │ Profiler │ ◀─────── │ SelectiveRateReporter │──▶ logs
//! └────────────┘                └──────────┘          └───────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use aggregating_profiler::error::Result;
use aggregating_profiler::{
    Identity, LoggingSink, PrefixedProfiler, Profiler, ProfilerSettings, SelectiveRateConfig,
    SelectiveRateReporter,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Aggregating profiler demo - synthetic workload with periodic reporting
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Selective rate configuration file (.json, .yaml or .yml)
    #[arg(long, env = "PROFILER_CONFIG")]
    config: Option<PathBuf>,

    /// Default reporting period in milliseconds when no config file is given
    #[arg(long, env = "PROFILER_PERIOD_MS", default_value = "1000")]
    period_ms: u64,

    /// How long to run the workload, in seconds
    #[arg(long, env = "PROFILER_DURATION_SECONDS", default_value = "5")]
    duration_seconds: u64,

    /// Number of concurrent workers
    #[arg(long, env = "PROFILER_WORKERS", default_value = "4")]
    workers: usize,

    /// Running calls tracked per identity between reports
    #[arg(long, env = "PROFILER_ACTIVE_CALLS", default_value = "32")]
    active_calls_to_track: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => SelectiveRateConfig::from_file(path)?,
        None => SelectiveRateConfig::with_default_period(Duration::from_millis(args.period_ms)),
    };
    config.validate()?;

    info!("Starting profiler demo");
    info!("  Default period: {}ms", config.default_period_ms);
    info!("  Scheduled groups: {}", config.reporting_schedule.len());
    info!("  Workers: {}", args.workers);
    info!("  Duration: {}s", args.duration_seconds);

    let profiler = Profiler::with_settings(ProfilerSettings {
        active_calls_to_track: args.active_calls_to_track,
        ..ProfilerSettings::default()
    })?;

    let in_flight = Arc::new(AtomicI64::new(0));
    let gauge = in_flight.clone();
    profiler.attach_indicator("demo.in_flight", move || Ok(gauge.load(Ordering::Relaxed)));

    let (_config_tx, config_rx) = watch::channel(config);
    let reporter = SelectiveRateReporter::start(&profiler, config_rx, LoggingSink)?;

    let stop = CancellationToken::new();
    let workers: Vec<_> = (0..args.workers)
        .map(|worker| {
            let demo = PrefixedProfiler::new(profiler.clone(), "demo");
            tokio::spawn(run_worker(worker, demo, in_flight.clone(), stop.clone()))
        })
        .collect();

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_seconds)) => {
            info!("Workload finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    stop.cancel();
    for worker in futures::future::join_all(workers).await {
        if let Err(e) = worker {
            error!("Worker failed: {}", e);
        }
    }

    reporter.flush_now();
    reporter.shutdown().await;

    info!("Profiler demo shutdown complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

async fn run_worker(
    worker: usize,
    profiler: PrefixedProfiler,
    in_flight: Arc<AtomicI64>,
    stop: CancellationToken,
) {
    let worker_tag = worker.to_string();
    let query = profiler.profiled_call(Identity::with_tag_map("db.query", [("worker", worker_tag.as_str())]));
    let cache = profiler.profiled_call("cache.lookup");
    let mut iteration: u64 = 0;

    while !stop.is_cancelled() {
        iteration += 1;

        in_flight.fetch_add(1, Ordering::Relaxed);
        let rows = query
            .profile_future(async {
                tokio::time::sleep(Duration::from_millis(5 + iteration % 20)).await;
                (iteration % 50) as i64
            })
            .await;
        in_flight.fetch_sub(1, Ordering::Relaxed);

        let lookup = cache.start();
        tokio::time::sleep(Duration::from_millis(iteration % 3)).await;
        if iteration % 10 == 0 {
            lookup.close();
        } else {
            lookup.stop_with_payload(rows);
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
