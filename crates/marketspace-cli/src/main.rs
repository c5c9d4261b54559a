//! Marketspace CLI - manage your Marketspace session from the terminal.
//!
//! Signs in against the Marketspace API, keeps the session between runs, and
//! shows or edits the signed-in profile.

mod app;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use marketspace_core::Config;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::{App, Cli};

/// Log file name prefix inside the log directory (rotated daily)
const LOG_FILE_PREFIX: &str = "marketspace.log";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a log directory is available, to a daily
/// rotated file. The returned guard must live until exit so the file writer
/// flushes.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config ({}), using defaults", e);
            Config::default()
        }
    };
    if let Ok(url) = std::env::var("MARKETSPACE_API_URL") {
        config.api_base_url = url;
    }

    let _log_guard = init_tracing(config.log_dir().ok());
    info!(api = %config.api_base_url, backend = ?config.storage_backend, "Marketspace CLI starting");

    let mut app = App::new(config).await?;
    let result = app.run(cli.command).await;

    if let Err(e) = app.shutdown().await {
        warn!(error = %e, "Failed to persist session on exit");
    }

    info!("Marketspace CLI shutting down");
    result
}
