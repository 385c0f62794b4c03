use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use variant_lab::{
    cli::{execute_command, run_daemon, Cli, Commands},
    config::{Config, LogFormat},
    provider::ProviderClient,
    service::AppState,
    storage::SqliteStorage,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "variant-lab starting...");

    // Initialize storage
    let storage = match SqliteStorage::new(&config.database).await {
        Ok(s) => {
            info!(path = %config.database.path.display(), "Database initialized");
            s
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize database");
            return Err(e.into());
        }
    };

    // Initialize provider client
    let provider = match ProviderClient::new(&config.provider, config.request.clone()) {
        Ok(c) => {
            info!(base_url = %config.provider.base_url, "Provider client initialized");
            c
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize provider client");
            return Err(e.into());
        }
    };

    let state = AppState::new(config, Arc::new(storage), Arc::new(provider));

    match cli.command {
        Commands::Daemon {
            interval_secs,
            with_snapshot,
        } => {
            run_daemon(&state, Duration::from_secs(interval_secs.max(1)), with_snapshot).await;
            info!("Scheduler shutdown complete");
            Ok(())
        }
        command => {
            let result = execute_command(command, &state).await;
            if result.exit_code == 0 {
                println!("{}", result.message);
            } else {
                eprintln!("{}", result.message);
            }
            std::process::exit(result.exit_code);
        }
    }
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
