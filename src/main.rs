// src/main.rs

//! The main entry point for the burrow tunnel application.

use anyhow::{Context, Result};
use burrow::config::{Config, Mode};
use burrow::{listener, server};
use std::env;
use std::sync::Mutex;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("burrow version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path.
    // It can be provided via a --config flag; otherwise, it defaults to "burrow.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("burrow.toml");

    // Load the tunnel configuration from the determined path.
    // If loading fails, print the error and exit, as the tunnel
    // cannot run without a valid configuration.
    let mut config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    // Override the mode if provided as a command-line flag, and re-validate,
    // since the URI schemes are checked against the mode.
    if args.contains(&"--listener".to_string()) {
        config.mode = Mode::Listener;
    }
    if args.contains(&"--server".to_string()) {
        config.mode = Mode::Server;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration for the selected mode: {e}");
        std::process::exit(1);
    }

    // Get the log level from the env var, falling back to the config.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Initialize the global subscriber: a configured log_path redirects
    // records to a file, otherwise they go to stdout.
    match config.log_path.as_deref().filter(|p| !p.is_empty()) {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file at '{path}'"))?;
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(log_level))
                .compact()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new(log_level))
                .compact() // Use the compact, single-line format.
                .with_ansi(true) // Enable ANSI color codes for log levels.
                .init();
        }
    }

    let result = match config.mode {
        Mode::Listener => listener::run(config).await,
        Mode::Server => server::run(config).await,
    };

    if let Err(e) = result {
        error!("Tunnel runtime error: {e}");
        return Err(e);
    }

    Ok(())
}
