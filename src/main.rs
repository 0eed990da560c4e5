use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use coopcam::config::CoopcamConfig;
use coopcam::events::MotionBus;
use coopcam::manager::StreamManager;
use coopcam::motion::{MotionEngine, WorkerPool};
use coopcam::pool::FrameBufferPool;
use coopcam::recording::{FfmpegEncoder, MotionHistory, RecordingController};
use coopcam::server::{self, AppState};
use coopcam::sse::SseBroadcaster;

/// Worker threads may finish their in-flight frame for this long at shutdown
const WORKER_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "coopcam")]
#[command(about = "Multi-camera MJPEG fan-out server with motion detection and clip recording")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "coopcam.toml")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long)]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", CoopcamConfig::default_toml());
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting coopcam v{}", env!("CARGO_PKG_VERSION"));

    let config = match CoopcamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {}: {}", args.config, e);
            return Err(e.into());
        }
    };
    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    if args.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    info!(
        "Configuration loaded: {} sources, default \"{}\"",
        config.sources.len(),
        config.default_source_id()
    );

    let cancel = CancellationToken::new();
    let pool = Arc::new(FrameBufferPool::new());
    let bus = MotionBus::new(64);

    let workers = Arc::new(WorkerPool::new(&config.motion.worker_pool));
    let engine = config.motion.enabled.then(|| {
        Arc::new(MotionEngine::new(
            config.motion.clone(),
            Arc::clone(&workers),
            bus.clone(),
        ))
    });

    let recorder = config.recording.enabled.then(|| {
        let encoder = Arc::new(FfmpegEncoder::new(
            &config.recording.video_codec,
            &config.recording.video_preset,
        ));
        Arc::new(RecordingController::new(config.recording.clone(), encoder))
    });

    let sse = Arc::new(SseBroadcaster::new());
    Arc::clone(&sse).run(bus.clone(), cancel.child_token());

    let history = Arc::new(MotionHistory::new(
        coopcam::recording::history::DEFAULT_HISTORY_CAPACITY,
    ));
    Arc::clone(&history).run(bus.clone(), cancel.child_token());

    if let Some(recorder) = &recorder {
        recorder.run(bus.clone(), cancel.child_token());
        recorder.spawn_retention_sweep(cancel.child_token());
    }

    let manager = Arc::new(StreamManager::new(
        &config,
        Arc::clone(&pool),
        engine.clone(),
        recorder.clone(),
        cancel.child_token(),
    ));
    manager.prewarm();

    // SIGINT drives the graceful path; a second signal kills the process
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_cancel.cancel();
        }
    });

    let state = AppState {
        manager: Arc::clone(&manager),
        sse,
        history,
        pool,
        workers: Arc::clone(&workers),
        engine,
        recorder,
        pause_password: config.stream_pause_password.clone(),
        pause_duration: Duration::from_secs(config.pause_duration_secs),
    };

    let result = server::serve(state, &config.server, cancel.clone()).await;

    manager.shutdown();
    workers.shutdown(WORKER_SHUTDOWN_DEADLINE);

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let default_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("coopcam={},warn", default_level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log_format.as_deref() {
        Some("json") => builder.json().init(),
        Some("compact") => builder.compact().init(),
        _ => builder.init(),
    }

    Ok(())
}
