//! Refract server binary.
//!
//! Loads the TOML configuration named on the command line, assembles the
//! storage dispatcher, engine and coordinator, and serves the gateway.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use refract::config::AppConfig;
use refract::engine::KernelEngine;
use refract::processor::{Coordinator, Dispatcher, HookRegistry};
use refract::server::{AppState, build_router, serve};
use refract::storage::StorageDispatcher;

/// On-the-fly image transformation gateway.
#[derive(Parser, Debug)]
#[command(name = "refract")]
#[command(about = "Image transformation gateway in front of an object store")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, env = "REFRACT_CONFIG")]
    config: std::path::PathBuf,

    /// Override the configured listen address.
    #[arg(long, env = "REFRACT_LISTEN")]
    listen: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info", env = "REFRACT_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = AppConfig::from_toml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let placeholder = config
        .load_placeholder()
        .context("loading placeholder image")?;
    info!(
        buckets = config.buckets.len(),
        placeholder = placeholder.is_some(),
        "configuration loaded"
    );

    let storage = Arc::new(StorageDispatcher::from_config(&config));
    let engine = Arc::new(KernelEngine::new());
    let coordinator = Arc::new(Coordinator::new(&config, storage, engine, placeholder));
    let dispatcher = Arc::new(Dispatcher::new(
        coordinator,
        HookRegistry::new(),
        config.server.queue_len,
        config.server.process_timeout(),
    ));

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen.clone());
    let state = AppState {
        config: Arc::new(config),
        dispatcher,
    };

    serve(&listen, build_router(state)).await
}
