// [[STUDIO]]/apps/studio-server/src/server/handlers.rs
// Purpose: API Handlers. Run control, SSE and WebSocket event streams.
// Architecture: API Layer
// Dependencies: Axum, Registry

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, Path, Query, State,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures::{
    sink::SinkExt,
    stream::{Stream, StreamExt},
};
use std::sync::Arc;

use super::errors::ApiError;
use super::AppState;
use crate::events::RuntimeEvent;
use crate::models::*;
use crate::registry::RunRegistry;

#[derive(serde::Deserialize)]
pub struct RunQuery {
    run_id: Option<String>,
}

#[derive(serde::Serialize)]
pub struct HealthResponse {
    status: String,
    message: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Graph Studio kernel is running".to_string(),
    })
}

pub async fn get_graph(State(state): State<AppState>) -> Json<GraphModel> {
    Json(state.launcher.topology())
}

pub async fn start_run(State(state): State<AppState>) -> Json<StartRunResponse> {
    // Returns immediately; the run proceeds on its own task
    let run_id = state.launcher.launch(&state.registry);
    tracing::debug!("Run {} of graph {} requested over HTTP", run_id, state.launcher.name());
    Json(StartRunResponse { run_id })
}

pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let run_id = query
        .run_id
        .ok_or_else(|| ApiError::BadRequest("run_id is required".to_string()))?;
    let events = state.registry.event_stream(&run_id)?;
    tracing::info!("SSE consumer attached to run {}", run_id);

    let events = events.map(|event| Event::default().json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn list_runs(State(state): State<AppState>) -> Json<Vec<RunSnapshot>> {
    Json(state.registry.list())
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.registry.snapshot(&run_id)?))
}

pub async fn submit_input(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<SubmitInputRequest>,
) -> Result<Json<SubmitInputResponse>, ApiError> {
    let accepted = state
        .registry
        .resolve(&run_id, &request.request_id, &request.response)
        .await?;
    if !accepted {
        return Err(ApiError::RequestNotPending(request.request_id));
    }
    Ok(Json(SubmitInputResponse { accepted }))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelRunResponse>, ApiError> {
    let cancelled = state.registry.cancel(&run_id).await?;
    Ok(Json(CancelRunResponse { cancelled }))
}

pub async fn ws_run_stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.registry.event_stream(&run_id)?;
    Ok(ws.on_upgrade(move |socket| handle_run_stream(socket, state.registry, events, run_id)))
}

async fn handle_run_stream(
    socket: WebSocket,
    registry: Arc<RunRegistry>,
    events: impl Stream<Item = RuntimeEvent> + Send + 'static,
    run_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = Box::pin(events);
    tracing::info!("WebSocket consumer attached to run {}", run_id);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::error!("Run {}: failed to encode event #{}: {}", run_id, event.seq, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        tracing::info!("Client disconnected from run stream: {}", run_id);
                        break;
                    }
                }
                None => {
                    tracing::info!("Run {} stream complete. Closing socket.", run_id);
                    let _ = sender.close().await;
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_client_message(&registry, &run_id, &text).await,
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Client disconnected from run stream: {}", run_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Run {}: socket error: {}", run_id, e);
                    break;
                }
            }
        }
    }
}

/// Inbound frames are input submissions: `{"request_id": .., "response": ..}`.
async fn handle_client_message(registry: &RunRegistry, run_id: &str, text: &str) {
    let request: SubmitInputRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Run {}: ignoring malformed client message: {}", run_id, e);
            return;
        }
    };
    match registry.resolve(run_id, &request.request_id, &request.response).await {
        Ok(true) => tracing::info!("Run {}: input {} resolved over socket", run_id, request.request_id),
        Ok(false) => tracing::warn!("Run {}: input {} is not pending", run_id, request.request_id),
        Err(e) => tracing::warn!("Run {}: input {} rejected: {}", run_id, request.request_id, e),
    }
}
