// [[STUDIO]]/apps/studio-server/src/server/mod.rs
// Purpose: HTTP/WebSocket surface. Shared state, graph launcher seam, router.
// Architecture: API Layer
// Dependencies: Axum, tower-http

pub mod errors;
pub mod handlers;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::flow::FlowGraph;
use crate::models::GraphModel;
use crate::registry::RunRegistry;

/// Type-erased handle on the graph this server runs.
pub trait GraphLauncher: Send + Sync {
    fn name(&self) -> &str;
    fn topology(&self) -> GraphModel;
    fn launch(&self, registry: &RunRegistry) -> String;
}

pub struct FlowLauncher<D> {
    name: String,
    graph: Arc<FlowGraph<D>>,
    deps: D,
}

impl<D> FlowLauncher<D> {
    pub fn new(name: &str, graph: FlowGraph<D>, deps: D) -> Self {
        Self {
            name: name.to_string(),
            graph: Arc::new(graph),
            deps,
        }
    }
}

impl<D: Clone + Send + Sync + 'static> GraphLauncher for FlowLauncher<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn topology(&self) -> GraphModel {
        self.graph.topology()
    }

    fn launch(&self, registry: &RunRegistry) -> String {
        let start = self.graph.start_step(Value::Null);
        registry.start_run(&self.name, self.graph.clone(), start, self.deps.clone())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RunRegistry>,
    pub launcher: Arc<dyn GraphLauncher>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/graph", get(handlers::get_graph))
        .route("/api/run", post(handlers::start_run))
        .route("/api/events", get(handlers::stream_events))
        .route("/api/runs", get(handlers::list_runs))
        .route("/api/runs/:run_id", get(handlers::get_run))
        .route("/api/runs/:run_id/input", post(handlers::submit_input))
        .route("/api/runs/:run_id/cancel", post(handlers::cancel_run))
        .route("/ws/runs/:run_id", get(handlers::ws_run_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
