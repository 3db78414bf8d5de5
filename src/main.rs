use anyhow::Result;
use clap::Parser;
use ppecam::config::{OutputMode, SourceKind};
use ppecam::{
    detect, hls, source, BackendClient, FrameBridge, PendingViolations, PipelineSupervisor,
    PpecamConfig, StreamProbe, StreamServer, SystemStatus, ViolationSubmitter, ViolationThrottle,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ppecam")]
#[command(about = "PPE compliance camera service with live detection streaming")]
#[command(version)]
#[command(long_about = "Ingests a live video source, runs each frame through an \
object-detection stage, republishes the annotated stream to connected viewers, and \
reports protective-equipment violations to a backend with per-type throttling.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ppecam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the service")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting ppecam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match PpecamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    // Segmented mode starts from an empty output directory
    if config.output.mode == OutputMode::Segmented {
        let output_dir = Path::new(&config.output.output_dir);
        match hls::clean_output_dir(output_dir) {
            Ok(removed) if removed > 0 => {
                info!("Cleaned {} files from {}", removed, output_dir.display())
            }
            Ok(_) => {}
            Err(e) => warn!("Output directory cleanup failed: {}", e),
        }
        std::fs::create_dir_all(output_dir)?;
    }

    // Resolve stream geometry before the pipeline starts. Probing runs
    // external tools, so keep it off the async runtime's workers.
    let probe_config = config.clone();
    let (width, height, fps) = tokio::task::spawn_blocking(move || {
        resolve_stream_info(&probe_config)
    })
    .await?;
    info!("Resolution: {}x{}, FPS: {}", width, height, fps);
    info!("Output mode: {}", config.output.mode);

    // Shared state, constructed once for the process lifetime
    let status = Arc::new(SystemStatus::new());
    let bridge = Arc::new(FrameBridge::new(Duration::from_millis(
        config.output.enqueue_timeout_ms,
    )));
    let pending = Arc::new(PendingViolations::default());
    let throttle = Arc::new(ViolationThrottle::new(Duration::from_secs(
        config.backend.violation_delay_seconds,
    )));

    let detector = detect::from_config(&config.detector)?;
    status.set_detector_ready(true);

    let backend = BackendClient::new(&config.backend)?;
    let mut submitter = ViolationSubmitter::start(
        Arc::clone(&pending),
        Arc::clone(&throttle),
        backend,
        config.output.jpeg_quality,
    )?;

    let cancel = CancellationToken::new();

    let factory_config = config.clone();
    let supervisor = PipelineSupervisor::new(
        config.clone(),
        (width, height),
        fps,
        Box::new(move || source::from_config(&factory_config, width, height)),
        detector,
        Arc::clone(&bridge),
        Arc::clone(&status),
        Arc::clone(&pending),
        cancel.clone(),
    );
    let pipeline = supervisor.spawn()?;

    // Ctrl-C is the only way out of the supervisory loop
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal_cancel.cancel();
        }
    });

    let server = StreamServer::new(&config, Arc::clone(&bridge), Arc::clone(&status));
    let served = server.serve(cancel.clone()).await;

    // Shutdown order: source and encoder first (via the pipeline), then
    // the submission context. The pipeline notices cancellation at its
    // next frame boundary; don't hang shutdown on a stalled source.
    cancel.cancel();
    let join_deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !pipeline.is_finished() && std::time::Instant::now() < join_deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if pipeline.is_finished() {
        if pipeline.join().is_err() {
            error!("Capture pipeline thread panicked");
        }
    } else {
        warn!("Capture pipeline did not stop in time");
    }
    submitter.stop();

    served?;
    info!("ppecam shut down cleanly");
    Ok(())
}

/// Determine source dimensions and frame rate.
///
/// Webcams use the configured resolution and a fixed 30 fps; url and file
/// sources are probed, with fixed fallbacks on probe failure.
fn resolve_stream_info(config: &PpecamConfig) -> (u32, u32, f64) {
    match config.source.kind {
        SourceKind::Webcam => {
            let (width, height) = config.source.webcam_resolution;
            info!(
                "Using webcam device {} at {}x{}",
                config.source.webcam_index, width, height
            );
            (width, height, 30.0)
        }
        SourceKind::Url | SourceKind::File => {
            let locator = config.source.locator();
            info!("Probing source: {}", locator);
            let probe = StreamProbe::new(&config.ffmpeg);
            let (width, height) = probe.dimensions(locator);
            let fps = probe.frame_rate(locator);
            (width, height, fps)
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ppecam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
        None => fmt::layer()
            .with_target(true)
            .with_thread_ids(args.debug)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format.
fn print_default_config() {
    let default_config = r#"# Ppecam Configuration File
# This is the default configuration with all available options

[source]
# Source kind: "url", "webcam", or "file"
kind = "url"
# Stream URL (kind = "url")
url = ""
# Local video file path (kind = "file")
file_path = ""
# Capture device index (kind = "webcam", e.g. 0 for /dev/video0)
webcam_index = 0
# Requested webcam resolution (width, height)
webcam_resolution = [640, 480]

[server]
# IP address to bind to
ip = "0.0.0.0"
# Port to listen on
port = 8081

[output]
# Delivery mode: "push" (continuous multipart stream) or "segmented" (HLS playlist)
mode = "push"
# Directory holding the playlist and segment files (segmented mode)
output_dir = "output/hls"
# Playlist file name
playlist_name = "stream.m3u8"
# Target segment duration in seconds
segment_seconds = 10
# Number of segments kept in the playlist
playlist_size = 10
# Segments kept beyond the playlist before deletion
delete_threshold = 1
# JPEG quality for push-mode frames (1-100)
jpeg_quality = 85
# Multipart boundary token
boundary = "frame"
# Per-client broadcast queue depth
max_queue_depth = 1
# Bounded wait for the delivery bridge, in milliseconds
enqueue_timeout_ms = 100

[detector]
# Path to the detection model file
model_path = "models/best.pt"
# Inference device (cpu, cuda, mps, ...)
device = "cpu"
# Class-id filter applied by the model
classes = [0, 1, 2, 3, 4, 5]

[backend]
# Backend API base URL
api_url = "http://localhost:8000"
# API key sent as X-API-Key
api_key = ""
# Camera identifier reported with each violation
camera_code = "CAM001"
# Minimum interval between submissions of the same violation type (3-10 seconds)
violation_delay_seconds = 5

[ffmpeg]
# Protocol whitelist passed to the decoder and probe tools
protocol_whitelist = "file,http,https,tcp,tls,crypto"
# Log level passed to the decoder/encoder processes
loglevel = "error"
# Probe timeout in seconds
probe_timeout_seconds = 10
"#;

    println!("{}", default_config);
}
