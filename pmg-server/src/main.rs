//! pmg-server - MIDI upload and continuation service
//!
//! Accepts MIDI uploads, extends them with a melody continuation model and
//! serves the resulting MIDI files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pmg_common::config::{
    load_toml_config_or_default, CompiledDefaults, RootFolderInitializer, RootFolderResolver,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pmg_server::generator::MarkovMelodyModel;
use pmg_server::{build_router, AppState, ServerConfig};

const MODULE_NAME: &str = "pmg-server";

/// Command-line arguments for pmg-server
#[derive(Parser, Debug)]
#[command(name = "pmg-server")]
#[command(about = "MIDI upload and continuation service")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PMG_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, env = "PMG_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Root folder for uploads, generated files and the session
    #[arg(short, long, env = "PMG_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// TOML config file (defaults to <config dir>/pmg/pmg-server.toml)
    #[arg(short, long, env = "PMG_CONFIG")]
    config: Option<PathBuf>,

    /// Fixed RNG seed for reproducible generation
    #[arg(long, env = "PMG_SEED")]
    seed: Option<u64>,

    /// Start with an empty session even if one was saved
    #[arg(long)]
    no_restore: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let toml_config = load_toml_config_or_default(args.config.as_deref(), MODULE_NAME);
    let defaults = CompiledDefaults::for_current_platform();

    // Initialize tracing
    let log_level = toml_config
        .logging
        .level
        .clone()
        .unwrap_or_else(|| defaults.log_level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Log build identification immediately after tracing init
    info!(
        "Starting pmg-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let root_folder = RootFolderResolver::new(MODULE_NAME)
        .with_cli(args.root_folder.clone())
        .with_toml(&toml_config)
        .resolve();
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directories()
        .context("Failed to initialize root folder")?;
    info!("Root folder: {}", initializer.root_folder().display());

    let mut generation = toml_config.generation.clone();
    if args.seed.is_some() {
        generation.seed = args.seed;
    }
    generation.validate().context("Invalid generation settings")?;

    let max_upload_bytes = toml_config
        .max_upload_bytes
        .unwrap_or(defaults.max_upload_bytes);
    let config = ServerConfig::from_root(&initializer, max_upload_bytes, generation.clone());

    let model = match generation.seed {
        Some(seed) => MarkovMelodyModel::with_seed(seed),
        None => MarkovMelodyModel::new(),
    };
    let state = AppState::new(config, Arc::new(model));

    let restore = !args.no_restore && toml_config.restore_session.unwrap_or(true);
    if restore {
        if state.session.restore(&initializer.session_path()).await.is_none() {
            info!("No saved session, starting empty");
        }
    } else {
        info!("Session restore disabled");
    }

    let app = build_router(state);

    let port = args.port.or(toml_config.port).unwrap_or(defaults.port);
    let bind_address = args
        .bind_address
        .or(toml_config.bind_address)
        .unwrap_or(defaults.bind_address);
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind_address, port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("pmg-server listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
