// [[STUDIO]]/apps/studio-server/src/main.rs
// Purpose: Entry point. Loads config, picks the served graph, starts the server.
// Architecture: Application Boot
// Dependencies: Axum, Tower, Tokio

mod bus;
mod config;
mod dag;
mod demos;
mod engine;
mod events;
mod flow;
mod instrument;
mod interaction;
mod models;
mod observability;
mod registry;
mod runtime;
mod server;

use std::sync::Arc;

use crate::config::StudioConfig;
use crate::demos::DemoDeps;
use crate::registry::RunRegistry;
use crate::server::{AppState, FlowLauncher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init_tracing();

    let config = StudioConfig::from_env()?;
    tracing::info!("Initializing Graph Studio kernel with {:?}", config);

    let graph = demos::build(&config.example).map_err(|e| {
        tracing::error!("Available graphs: {}", demos::NAMES.join(", "));
        e
    })?;
    let launcher = FlowLauncher::new(&config.example, graph, DemoDeps::from_env());

    let registry = Arc::new(RunRegistry::new(config.run_settings()));
    let app = server::build_router(AppState {
        registry: registry.clone(),
        launcher: Arc::new(launcher),
    });

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to port");

    tracing::info!("Graph Studio serving '{}' on http://{}", config.example, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    registry.shutdown().await;
    tracing::info!("Graph Studio stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
