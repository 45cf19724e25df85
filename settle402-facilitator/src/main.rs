//! settle402 facilitator HTTP server.
//!
//! # Usage
//!
//! ```bash
//! MASTER_SECRET=... cargo run -p settle402-facilitator --release -- --config config.toml
//! RUST_LOG=debug,audit=info cargo run -p settle402-facilitator
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG`: path to the TOML configuration (default: `config.toml`)
//! - `HOST`, `PORT`: override the bind address
//! - `RUST_LOG`: log filter (default: `info`)
//!
//! A `.env` file in the working directory is loaded first.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use settle402::authorization::AuthorizationCodec;
use settle402::chain::{ChainRegistry, ChainRpc, Eip155ChainProvider};
use tracing_subscriber::EnvFilter;

use settle402_facilitator::audit::{AuditSink, TracingAuditSink};
use settle402_facilitator::config::FacilitatorConfig;
use settle402_facilitator::directory::Directory;
use settle402_facilitator::engine::SettlementEngine;
use settle402_facilitator::monitor::FundingMonitor;
use settle402_facilitator::store::MemoryStore;
use settle402_facilitator::{AppContext, router};

/// Gasless ERC-3009 settlement facilitator.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded .env");
    }

    if let Err(e) = run(Args::parse()).await {
        tracing::error!("Facilitator failed: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = FacilitatorConfig::load_from(&args.config)?;
    let registry = Arc::new(config.registry()?);
    tracing::info!(
        host = %config.host,
        port = config.port,
        networks = registry.len(),
        default_network = %config.default_network,
        "Loaded configuration"
    );

    let mut chains = ChainRegistry::new();
    for network in registry.list() {
        match Eip155ChainProvider::new(network, &[config.endpoint(network)]) {
            Ok(provider) => {
                tracing::info!(
                    network = %network.network_id,
                    chain_id = network.chain_id,
                    rpc = %network.rpc_endpoint,
                    "Registered chain provider"
                );
                chains.insert(Arc::new(provider) as Arc<dyn ChainRpc>);
            }
            Err(e) => {
                tracing::warn!(
                    network = %network.network_id,
                    error = %e,
                    "Skipping network: provider unavailable"
                );
            }
        }
    }
    if chains.is_empty() {
        tracing::warn!("No chain providers available; settlements will fail");
    }

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let cipher = Arc::new(config.cipher());
    let directory = Arc::new(Directory::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&registry),
        cipher.clone(),
        Arc::clone(&audit),
        config.directory_config()?,
    ));
    let monitor = FundingMonitor::new(
        Arc::clone(&directory),
        chains.clone(),
        Arc::clone(&audit),
        config.funding_policy(),
    );
    let engine = SettlementEngine::new(
        Arc::clone(&directory),
        chains,
        cipher,
        audit,
        config.engine_config()?,
    );
    let app = router(Arc::new(AppContext {
        codec: AuthorizationCodec::new(Arc::clone(&registry), config.codec_config()),
        directory,
        monitor,
        engine,
    }));

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Facilitator listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Facilitator shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down..."),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot install SIGTERM handler");
                ctrl_c.await;
                tracing::info!("Received Ctrl-C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl-C, shutting down...");
    }
}
