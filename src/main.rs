// src/main.rs

//! The main entry point for the Unified ETL Engine.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};
use v2e_uee::config::Config;
use v2e_uee::engine;

const DEFAULT_CONFIG_PATH: &str = "uee.toml";

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("v2e-uee version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a
    // --config flag; otherwise it defaults to "uee.toml", which may be
    // absent (the engine then runs on built-in defaults).
    let explicit_config = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match explicit_config {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None => match Config::from_file(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => cfg,
            Err(_) => Config::default(),
        },
    };

    // Override the data directory if provided as a command-line argument.
    if let Some(dir_index) = args.iter().position(|arg| arg == "--data-dir") {
        if let Some(dir) = args.get(dir_index + 1) {
            config.data_dir = dir.clone();
        } else {
            eprintln!("--data-dir flag requires a value");
            std::process::exit(1);
        }
    }

    // Setup logging with reloading capabilities.
    // Get initial log level from env var or config.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());

    // Create a reloadable filter layer.
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    // Initialize the global subscriber with the reload and formatting layers.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    // Store the handle in an Arc to be used for dynamic log level changes.
    let reload_handle = Arc::new(reload_handle);

    info!("Starting Unified ETL Engine {VERSION}...");

    if let Err(e) = engine::run(config, reload_handle).await {
        error!("Engine runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
