//! Duplex command-line entry point.
//!
//! Maps flags and `AT_*` environment variables onto [`CoreConfig`], runs the
//! engine against the synthetic capture source (or cpal with the
//! `audio-cpal` feature), and translates the outcome into the documented
//! exit codes:
//!
//! | code | meaning |
//! |------|---------|
//! | 0    | clean shutdown |
//! | 2    | initialization failure |
//! | 3    | cleanup failure |
//! | 4    | unrecoverable resource exhaustion |
//!
//! Environment variables override matching flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use duplex_core::{ChannelMode, ComponentState, CoreConfig, DuplexEngine};
use tracing::{error, info, warn};

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 2;
const EXIT_CLEANUP_FAILURE: i32 = 3;
const EXIT_RESOURCE_EXHAUSTION: i32 = 4;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelsArg {
    Loopback,
    Mic,
    Both,
}

impl From<ChannelsArg> for ChannelMode {
    fn from(arg: ChannelsArg) -> Self {
        match arg {
            ChannelsArg::Loopback => ChannelMode::Loopback,
            ChannelsArg::Mic => ChannelMode::Mic,
            ChannelsArg::Both => ChannelMode::Both,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "duplex", version, about = "Two-channel capture pipeline", long_about = None)]
struct Args {
    /// Root of recordings, logs and emergency backups.
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Which channels to capture.
    #[arg(long, value_enum, default_value_t = ChannelsArg::Both)]
    channels: ChannelsArg,

    /// Sample rate in Hz.
    #[arg(long, default_value_t = 16_000)]
    sample_rate: u32,

    /// Capture queue capacity per channel.
    #[arg(long, default_value_t = 1000)]
    capture_queue: usize,

    /// Processing queue capacity per channel.
    #[arg(long, default_value_t = 500)]
    processing_queue: usize,

    /// Storage queue capacity per channel.
    #[arg(long, default_value_t = 250)]
    storage_queue: usize,

    /// Max SMALL (4 KiB) pool buffers.
    #[arg(long, default_value_t = 256)]
    pool_small: usize,

    /// Max MEDIUM (64 KiB) pool buffers.
    #[arg(long, default_value_t = 64)]
    pool_medium: usize,

    /// Max LARGE (1 MiB) pool buffers.
    #[arg(long, default_value_t = 16)]
    pool_large: usize,

    /// Flush threshold in bytes; 0 means 80% of the write buffer.
    #[arg(long, default_value_t = 0)]
    flush_bytes: usize,

    /// Flush when the oldest buffered entry reaches this age.
    #[arg(long, default_value_t = 1000)]
    flush_age_ms: u64,

    /// Flush when the storage stage has been idle this long.
    #[arg(long, default_value_t = 200)]
    idle_flush_ms: u64,

    /// Heartbeat deadline for registered worker threads.
    #[arg(long, default_value_t = 10_000)]
    thread_timeout_ms: u64,

    /// Stop after this many seconds; 0 runs until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, raw = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// `AT_*` variables override matching flags.
fn apply_env_overrides(args: &mut Args) {
    if let Ok(dir) = std::env::var("AT_WORKING_DIR") {
        args.working_dir = PathBuf::from(dir);
    }
    if let Some(v) = env_parsed("AT_SAMPLE_RATE") {
        args.sample_rate = v;
    }
    if let Some(v) = env_parsed("AT_POOL_SMALL") {
        args.pool_small = v;
    }
    if let Some(v) = env_parsed("AT_POOL_MEDIUM") {
        args.pool_medium = v;
    }
    if let Some(v) = env_parsed("AT_POOL_LARGE") {
        args.pool_large = v;
    }
    if let Some(v) = env_parsed("AT_QUEUE_CAPTURE") {
        args.capture_queue = v;
    }
    if let Some(v) = env_parsed("AT_QUEUE_PROCESSING") {
        args.processing_queue = v;
    }
    if let Some(v) = env_parsed("AT_QUEUE_STORAGE") {
        args.storage_queue = v;
    }
}

fn core_config(args: &Args) -> CoreConfig {
    CoreConfig {
        working_dir: args.working_dir.clone(),
        channels: args.channels.into(),
        sample_rate: args.sample_rate,
        capture_queue: args.capture_queue,
        processing_queue: args.processing_queue,
        storage_queue: args.storage_queue,
        pool_small: args.pool_small,
        pool_medium: args.pool_medium,
        pool_large: args.pool_large,
        flush_bytes: args.flush_bytes,
        flush_age: Duration::from_millis(args.flush_age_ms),
        idle_flush: Duration::from_millis(args.idle_flush_ms),
        thread_timeout: Duration::from_millis(args.thread_timeout_ms),
        ..CoreConfig::default()
    }
}

fn run() -> i32 {
    let mut args = Args::parse();
    apply_env_overrides(&mut args);

    let config = core_config(&args);
    info!(
        working_dir = ?config.working_dir,
        channels = ?config.channels,
        sample_rate = config.sample_rate,
        "duplex starting"
    );

    let engine = match DuplexEngine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %e, "engine initialization failed");
            return EXIT_INIT_FAILURE;
        }
    };

    if let Err(e) = engine.start() {
        error!(error = %e, "engine start failed");
        return EXIT_INIT_FAILURE;
    }

    // Ctrl-C asks for an ordered stop; the run loop notices and shutdown()
    // drains the queues before raising the system-wide flag.
    let stop = engine.stop_flag();
    if let Err(e) = ctrlc::set_handler(move || stop.store(true, std::sync::atomic::Ordering::SeqCst))
    {
        warn!(error = %e, "could not install Ctrl-C handler");
    }

    let duration = (args.duration_secs > 0).then(|| Duration::from_secs(args.duration_secs));
    let reason = engine.run_until(duration);
    info!(?reason, "stopping");

    let cleanup = engine.shutdown();

    if engine.monitor().resource_exhausted() {
        error!("pool exhausted beyond recovery");
        return EXIT_RESOURCE_EXHAUSTION;
    }

    match cleanup {
        Ok(report) => {
            // Teardown held together; the run still failed if any component
            // died along the way (e.g. a heartbeat timeout drove it to
            // ERROR). A storage hiccup that recovered via emergency backup
            // leaves every component alive and exits clean.
            let health = engine.monitor().health();
            let dead: Vec<&String> = health
                .components
                .iter()
                .filter(|(_, r)| r.state == ComponentState::Error)
                .map(|(name, _)| name)
                .collect();
            if dead.is_empty() {
                info!(steps = report.steps.len(), "clean shutdown");
                EXIT_OK
            } else {
                error!(?dead, "components failed during the run");
                EXIT_CLEANUP_FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "cleanup failed");
            EXIT_CLEANUP_FAILURE
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duplex=info".parse().unwrap()),
        )
        .init();

    std::process::exit(run());
}
