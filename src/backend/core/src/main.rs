//! Drover Server - Main entry point
//!
//! Runs the worker pool and scheduler of one instance.

use clap::Parser;
use std::sync::Arc;

use drover_core::{
    app::AppContext,
    config::Config,
    db::Database,
    jobs::{register_builtin_handlers, HandlerRegistry},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "drover-server", version, about = "Distributed background job server")]
struct Args {
    /// Configuration file; environment variables prefixed with DROVER__ override it
    #[arg(short, long, env = "DROVER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    telemetry::init_logging(&config.logging, "drover-server")?;
    telemetry::init_metrics(&config.metrics)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Drover Server"
    );

    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }
    db.ping().await?;

    let cache = AppContext::connect_cache(&config).await;

    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry);
    tracing::info!(handlers = ?registry.names(), "Handlers registered");

    let app = AppContext::build(&config, Arc::new(db.job_store()), cache, Arc::new(registry));
    app.start()?;

    shutdown_signal().await;

    app.shutdown().await;
    tracing::info!("Server shutdown complete");
    telemetry::shutdown_logging();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
