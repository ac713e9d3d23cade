//! HTTP and WebSocket surface of convoyd

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use convoy_common::TestNode;

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use crate::registry::AgentRegistry;
use crate::transport::split_websocket;

/// Shared handler state
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let orchestrator = Arc::new(Orchestrator::new(registry.clone(), config.event_buffer));
        Self {
            registry,
            orchestrator,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub agent_id: String,
    pub manifest_url: String,
    pub tree: TestNode,
    #[serde(default)]
    pub test_run_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub test_run_id: String,
}

/// Build the router
pub fn router(config: &ServerConfig, state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(&config.agent_path, get(agent_handler))
        .route("/api/runs", post(start_run_handler))
        .route("/api/agents", get(list_agents_handler))
        .route("/events", get(events_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run convoyd until ctrl-c
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    config.validate()?;
    let state = Arc::new(AppState::new(&config));

    let orchestrator = state.orchestrator.clone();
    let consumer = tokio::spawn(async move { orchestrator.run().await });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(
        "convoyd listening on http://{} (agents: {})",
        listener.local_addr()?,
        config.agent_path
    );

    axum::serve(listener, router(&config, state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    consumer.abort();
    info!("convoyd stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "convoyd",
        "version": convoy_common::VERSION,
    }))
}

async fn agent_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, frames) = split_websocket(socket);
        if let Err(e) = state.registry.serve_connection(frames, sink).await {
            error!("Agent connection error: {}", e);
        }
    })
}

async fn start_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRunRequest>,
) -> Response {
    if let Err(e) = state.registry.assign_id(Some(request.agent_id.clone())) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let test_run_id = state.orchestrator.start_run(
        &request.agent_id,
        request.manifest_url,
        request.tree,
        request.test_run_id,
    );
    (StatusCode::ACCEPTED, Json(StartRunResponse { test_run_id })).into_response()
}

async fn list_agents_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.agents())
}

async fn events_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let feed = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, feed))
}

async fn stream_events(
    mut socket: WebSocket,
    mut feed: tokio::sync::broadcast::Receiver<crate::registry::AgentMessage>,
) {
    loop {
        let message = match feed.recv().await {
            Ok(message) => message,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event subscriber lagging, skipped {} messages", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                continue;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            debug!("Event subscriber went away");
            break;
        }
    }
}
