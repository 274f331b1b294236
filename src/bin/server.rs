//! Metadata proxy server binary.
//!
//! Wires the controller to an in-memory cache and the placeholder
//! upstream adapter, starts the background services, and serves the
//! handler routes until interrupted. Production deployments swap the
//! cache and getter for the persistent store and a real provider
//! adapter at these seams.

#[path = "server/config.rs"]
mod config;
#[path = "server/handlers.rs"]
mod handlers;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use handlers::AppState;
use spines::cache::MemoryCache;
use spines::getter::UnimplementedGetter;
use spines::metrics::Metrics;
use spines::persist::CachePersister;
use spines::services::{CountCollector, DenormService, ServiceManager, StatsService};
use spines::Controller;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting spines");

    let metrics = Arc::new(Metrics::new()?);
    let cache = Arc::new(MemoryCache::new());
    let persister = Arc::new(CachePersister::new(cache.clone()));
    let ctrl = Controller::new(
        cache.clone(),
        Arc::new(UnimplementedGetter),
        persister,
        metrics.clone(),
    );

    // Retry any author refreshes that were in flight when we last shut
    // down.
    ctrl.resume_refreshes().await?;

    let mut services = ServiceManager::new();
    services.register(Arc::new(DenormService::new(ctrl.clone())));
    services.register(Arc::new(StatsService::new(ctrl.clone())));
    services.register(Arc::new(CountCollector::new(cache, metrics.clone())));
    services.start_all();

    let state = Arc::new(AppState { ctrl, metrics });
    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Drain background work before exiting so accepted edges land.
    services.shutdown().await;

    Ok(())
}
