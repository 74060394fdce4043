use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use lanwatch::config::Cli;
use lanwatch::discovery::{DiscoveryProvider, FallbackProvider};
use lanwatch::engine::Engine;
use lanwatch::logging::init_logging;
use lanwatch::network::resolve_target;
use lanwatch::resolve::{DnsResolver, NamingProvider};
use lanwatch::scanner::{ArpCacheScanner, ArpScanner};
use lanwatch::server::{router, AppState};
use lanwatch::store::PresenceStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    cli.validate()?;

    let store = if cli.in_memory_database() {
        PresenceStore::in_memory().await
    } else {
        PresenceStore::open(&cli.database).await
    }
    .with_context(|| format!("Failed to open database {}", cli.database.display()))?;

    let target = resolve_target(cli.interface.as_deref(), cli.subnet)?;
    tracing::info!(
        interface = %target.interface.name,
        subnet = %target.subnet,
        source = ?target.source_ip(),
        gateway = ?target.gateway,
        "Scan target resolved"
    );

    let discovery = FallbackProvider::new(
        ArpScanner::new(target.clone()),
        ArpCacheScanner::new().with_local_host(target.local_host()),
    );
    let provider: Arc<dyn DiscoveryProvider> = match cli.resolve_timeout() {
        Some(timeout) => Arc::new(NamingProvider::new(discovery, DnsResolver::new(timeout))),
        None => Arc::new(discovery),
    };

    let hub_config = cli.hub_config();
    let engine = Engine::start(cli.engine_config(target.subnet), hub_config, provider, store)
        .await
        .context("Failed to start scan loop")?;

    let app = router(AppState {
        engine: engine.handle(),
        send_timeout: hub_config.send_timeout,
    });

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    tracing::info!(addr = %cli.bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
