//! remctld daemon
//!
//! Authenticated remote command execution server. Loads a TOML
//! configuration describing the listener, keytab, and command table,
//! then serves connections until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remctl_core::{default_principal, Keytab};
use remctl_server::{config, Server};

#[derive(Parser)]
#[command(name = "remctld")]
#[command(about = "remctl remote command execution server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::load_config(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let keytab = Keytab::load(&config.keytab)
        .with_context(|| format!("failed to load keytab from {:?}", config.keytab))?;

    let principal = match &config.principal {
        Some(principal) => principal.clone(),
        None => {
            let hostname = gethostname::gethostname().to_string_lossy().into_owned();
            default_principal(&hostname)
        }
    };
    tracing::info!(principal, "serving as");

    let table = config.command_table();
    let server = Server::new(keytab, principal, table);

    // Graceful shutdown on Ctrl+C or SIGTERM
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, shutting down");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        cancel_clone.cancel();
    });

    server.run(&config.listen_address(), cancel).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
