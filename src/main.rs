use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use attendcam::{
    AttendcamConfig, Indicator, SessionController, SessionParams, SessionState,
};

#[derive(Parser, Debug)]
#[command(name = "attendcam")]
#[command(about = "Live attendance capture client streaming camera frames to a recognition backend")]
#[command(version)]
#[command(long_about = "Runs one live attendance session: acquires the camera, connects to the \
recognition backend over a persistent channel, streams encoded frames on a fixed cadence, and \
surfaces recognition outcomes until the session ends or is interrupted.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "attendcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Class the session is taken for
    #[arg(long, help = "Class identifier for the attendance session")]
    class_id: Option<i64>,

    /// Acting user (teacher/tutor) identifier
    #[arg(long, help = "Identifier of the user taking attendance")]
    user_id: Option<i64>,

    /// Restrict the session to a group within the class
    #[arg(long, help = "Optional group identifier within the class")]
    group_id: Option<i64>,

    /// Topic recorded for the session
    #[arg(long, help = "Optional topic recorded for the session")]
    session_topic: Option<String>,

    /// End the session after this many seconds
    #[arg(long, value_name = "SECONDS", help = "Stop the session after this many seconds")]
    duration: Option<u64>,

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
    #[arg(long, help = "Validate configuration file and exit without starting a session")]
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

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting attendcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let config = match AttendcamConfig::load_from_file(&args.config) {
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
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate()?;

    let params = SessionParams {
        class_id: args
            .class_id
            .ok_or_else(|| anyhow::anyhow!("--class-id is required to start a session"))?,
        user_id: args
            .user_id
            .ok_or_else(|| anyhow::anyhow!("--user-id is required to start a session"))?,
        group_id: args.group_id,
        session_topic: args.session_topic.clone(),
    };

    let mut controller = SessionController::new(config);

    // Status updates are the user-facing surface of the session
    controller.on_status_change(|update| {
        let marker = match update.indicator {
            Some(Indicator::Success) => "✓ ",
            Some(Indicator::Warning) => "! ",
            Some(Indicator::Neutral) => "· ",
            None => "",
        };
        println!("[{:?}] {}{}", update.state, marker, update.text);
    });

    controller.start(params).await?;

    let mut states = controller.state_watch();
    let deadline = args.duration.map(Duration::from_secs);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, ending session");
        }
        _ = async {
            loop {
                if *states.borrow() == SessionState::Closed {
                    return;
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
        } => {
            info!("Session closed");
        }
        _ = sleep_forever_or(deadline) => {
            info!("Configured duration elapsed, ending session");
        }
    }

    controller.stop().await?;

    info!("attendcam exiting");
    Ok(())
}

/// Sleeps for the given duration, or forever when none is configured.
async fn sleep_forever_or(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("attendcam={}", log_level)));

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed()
        }
        Some("compact") => {
            fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .boxed()
        }
        Some("pretty") | None => {
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Attendcam Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    let default_config = r#"[camera]
# Camera device index (e.g., 0 for /dev/video0)
index = 0
# Ideal capture resolution (width, height)
resolution = [1280, 720]
# Capability hint for transports that support it ("user" = front-facing)
facing_mode = "user"

[channel]
# Recognition backend endpoint
url = "ws://127.0.0.1:8000/ws/attendance"
# Bearer token appended as a `token` query parameter (optional)
# auth_token = "..."
# Reconnect attempts before the channel is reported as failed
max_retries = 5
# Base delay for exponential reconnect backoff, in milliseconds
base_delay_ms = 500
# Backoff ceiling, in milliseconds
max_delay_ms = 10000

[capture]
# Capture cadence, in milliseconds per frame
interval_ms = 1000
# JPEG quality factor (1-100)
jpeg_quality = 80

[session]
# How long a transient outcome indicator stays visible, in milliseconds
indicator_hold_ms = 2000
# Window after stop during which late outcomes are still surfaced
drain_window_ms = 250
"#;

    println!("{}", default_config);
}
