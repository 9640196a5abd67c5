//! # Humanoid Control
//!
//! Runs the dual-rate execution core against the simulated robot.
//!
//! Loads the controller TOML, builds the built-in behavior catalogue,
//! starts estimation and control, and logs a health summary every second
//! until Ctrl-C or `--run-for-s` elapses.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use humanoid_common::config::LogLevel;
use humanoid_common::consts::DEFAULT_CONFIG_PATH;
use humanoid_common::control::behavior::HighLevelBehavior;
use humanoid_common::control::snapshot::RobotStateSnapshot;
use humanoid_control::behavior::catalogue::build_machine;
use humanoid_control::config::load_config;
use humanoid_control::estimation::PassThroughEstimator;
use humanoid_control::scheduler::{DualRateScheduler, SchedulerHealth, SchedulerParts};
use humanoid_control::sim::simulated_robot;
use humanoid_control::sink::CommandSink;
use humanoid_control::telemetry::TracingTelemetry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Interval between health log lines.
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);

/// Humanoid dual-rate control core (simulated robot)
#[derive(Parser, Debug)]
#[command(name = "humanoid_control")]
#[command(version)]
#[command(about = "Dual-rate estimation/control loop with behavior arbitration")]
struct Args {
    /// Path to the controller configuration TOML.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    run_for_s: Option<f64>,

    /// Behavior to request once the scheduler is running.
    #[arg(long, value_name = "STATE")]
    request: Option<HighLevelBehavior>,

    /// Warm-up iterations per behavior before start.
    #[arg(long, value_name = "N", default_value_t = 0)]
    warm_up: usize,
}

fn main() {
    let args = Args::parse();

    // The config log level only applies once the file is loaded; start
    // from the CLI level so load errors are visible.
    let loaded = match load_config(&args.config) {
        Ok(loaded) => {
            setup_tracing(&args, loaded.config.shared.log_level);
            loaded
        }
        Err(e) => {
            setup_tracing(&args, LogLevel::Info);
            error!("FATAL: {e}");
            process::exit(1);
        }
    };

    info!("Humanoid control v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args, loaded) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Humanoid control shutdown complete");
}

fn run(
    args: &Args,
    loaded: humanoid_control::config::LoadedConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Config OK: service={}, joints={}, estimation={}us, control={}us",
        loaded.config.shared.service_name,
        loaded.joints.len(),
        loaded.config.estimation.period_us,
        loaded.config.control.period_us,
    );

    let (mut machine, requester) = build_machine(&loaded.joints, &loaded.config.behavior)?;
    if args.warm_up > 0 {
        let snapshot = RobotStateSnapshot::zeroed(loaded.joints.len());
        machine.warm_up(&snapshot, args.warm_up)?;
        info!("Warm-up complete ({} iterations per behavior)", args.warm_up);
    }

    let (sensors, writer, sim) = simulated_robot(&loaded.joints);
    let parts = SchedulerParts {
        sensors,
        estimator: PassThroughEstimator,
        machine,
        sink: CommandSink::new(Arc::clone(&loaded.joints), writer),
        telemetry: TracingTelemetry::new(),
    };
    let mut scheduler =
        DualRateScheduler::new(loaded.scheduler_settings(), Arc::clone(&loaded.joints), parts);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    scheduler.start()?;
    if let Some(state) = args.request {
        info!("Requesting behavior '{state}'");
        requester.request_state(state);
    }

    let deadline = args
        .run_for_s
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .and_then(|d| Instant::now().checked_add(d));
    let mut next_report = Instant::now() + HEALTH_INTERVAL;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            break;
        }
        if now >= next_report {
            log_health(&scheduler.health());
            next_report += HEALTH_INTERVAL;
        }
        thread::sleep(Duration::from_millis(50));
    }

    scheduler.stop()?;
    let health = scheduler.health();
    log_health(&health);
    info!(
        "Output: {} commands applied, {} ticks skipped",
        sim.applied(),
        sim.skipped()
    );
    Ok(())
}

fn log_health(health: &SchedulerHealth<HighLevelBehavior>) {
    let state = health.current_state.map_or("none", |s| s.name());
    info!(
        "state={} est[ticks={} late={} published={} sensor_faults={}] \
         ctl[ticks={} late={} stale={} invalid={} leads={} lags={} delay={}us] \
         transitions={} illegal={} gaps={}",
        state,
        health.estimation.tick_count,
        health.estimation.late_ticks,
        health.estimation_stats.published,
        health.estimation_stats.sensor_faults,
        health.control.tick_count,
        health.control.late_ticks,
        health.control_stats.stale_reads,
        health.control_stats.invalid_commands,
        health.control_stats.controller_leads,
        health.control_stats.controller_lags,
        health.control_stats.last_delay_ns / 1_000,
        health.machine.transitions,
        health.machine.illegal_requests + health.machine.illegal_transitions,
        health.machine.unregistered_fallbacks,
    );
}

fn setup_tracing(args: &Args, level: LogLevel) {
    let level = if args.verbose { "debug" } else { level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
