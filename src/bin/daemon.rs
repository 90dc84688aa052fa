//! Photovault daemon: writes queued metadata edits back into image files.
//!
//! The daemon owns the job scheduler. Edits queued by `photovault submit`
//! (or any other writer to the shared SQLite database) are picked up on the
//! next poll, conflated and written with `exiftool`.
//!
//! ## Usage
//!
//! ```bash
//! photovault-daemon              # Run in foreground
//! photovault-daemon --once       # Run a single scheduling cycle and exit
//! ```

use anyhow::Result;
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{error, info};

use photovault::config::Config;
use photovault::{logging, Pipeline};

#[derive(Default)]
struct DaemonArgs {
    /// Run one cycle and exit
    once: bool,
    /// Poll interval override (seconds)
    poll_interval: Option<u64>,
    /// Config path override
    config_path: Option<PathBuf>,
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut daemon_args = DaemonArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                daemon_args.once = true;
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    if let Ok(interval) = args[i + 1].parse() {
                        daemon_args.poll_interval = Some(interval);
                    }
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    daemon_args.config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    daemon_args
}

fn print_help() {
    println!(
        r#"photovault-daemon - metadata write-back daemon for Photovault

USAGE:
    photovault-daemon [OPTIONS]

OPTIONS:
    --once, -1          Run a single scheduling cycle and exit
    --interval, -i N    Poll interval in seconds (overrides config)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    PHOTOVAULT_CONFIG   Path to config file (overrides default location)
    PHOTOVAULT_LOG      Log filter (trace, debug, info, warn, error)

Requires exiftool on PATH, or metadata_write.exiftool_path in the config."#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if std::io::stderr().is_terminal() {
        logging::init_stderr()?;
    } else {
        logging::init(Some(Config::config_dir().join("logs")))?;
    }

    info!("Photovault daemon starting");

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(interval) = args.poll_interval {
        config.scheduler.poll_interval_secs = interval;
    }

    let pipeline = Pipeline::build(config)?;
    info!(db = %pipeline.config.db_path.display(), "Database opened");

    let warmed = pipeline.warm_up();
    info!(images = warmed, "Cache ready");

    if args.once {
        info!("Running in single-shot mode");
        let report = pipeline.scheduler.run_cycle().await;
        info!(?report, "Cycle finished");
        return Ok(());
    }

    let scheduler = pipeline.start();
    tokio::select! {
        result = scheduler => {
            if let Err(e) = result {
                error!(error = %e, "Scheduler task ended unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    info!("Photovault daemon stopped");
    Ok(())
}
