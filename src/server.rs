use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::llm::LiteLLMClient;
use crate::models::{
    ChatRequest, ChatResponse, ClearResponse, HistoryResponse, SessionResponse, StreamEvent,
};
use crate::rag::embeddings::Embedder;
use crate::rag::RagPipeline;

pub struct AppState {
    pub pipeline: Arc<RagPipeline>,
    pub embedder: Arc<Embedder>,
    pub llm_health: Option<Arc<LiteLLMClient>>,
}

impl AppState {
    pub fn new(pipeline: Arc<RagPipeline>, embedder: Arc<Embedder>) -> Self {
        Self {
            pipeline,
            embedder,
            llm_health: None,
        }
    }

    pub fn with_llm_health(mut self, client: Arc<LiteLLMClient>) -> Self {
        self.llm_health = Some(client);
        self
    }
}

pub fn create_app(state: Arc<AppState>, frontend_url: Option<&str>) -> Router {
    Router::new()
        .route("/api/chat/message", post(message_handler))
        .route("/api/chat/message/stream", post(stream_handler))
        .route("/api/chat/history/:session_id", get(history_handler))
        .route("/api/chat/session/:session_id", delete(clear_session_handler))
        .route("/api/chat/session", post(new_session_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .layer(cors_layer(frontend_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    let origin = match frontend_url.map(HeaderValue::from_str) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(e)) => {
            tracing::warn!("Ignoring invalid FRONTEND_URL ({}), allowing any origin", e);
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any)
}

async fn message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let response = state.pipeline.answer(request).await?;
    Ok(Json(response))
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state.pipeline.stream(request)?;

    let events = UnboundedReceiverStream::new(stream.events).map(|event| {
        let frame = Event::default().json_data(&event).unwrap_or_else(|e| {
            tracing::error!("Failed to encode stream event: {}", e);
            Event::default().data(r#"{"type":"error","error":"Failed to encode stream event"}"#)
        });
        Ok::<_, Infallible>(frame)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<HistoryResponse> {
    let history = state.pipeline.sessions().history(&session_id).await;
    Json(HistoryResponse {
        session_id,
        history,
    })
}

async fn clear_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<ClearResponse> {
    state.pipeline.sessions().clear(&session_id).await;
    Json(ClearResponse {
        success: true,
        message: "Session cleared".to_string(),
    })
}

async fn new_session_handler(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    Json(SessionResponse {
        session_id: state.pipeline.sessions().new_id(),
    })
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let llm_healthy = match state.llm_health.as_ref() {
        Some(client) => Some(client.health_check().await.unwrap_or(false)),
        None => None,
    };

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "services": {
            "sessions": state.pipeline.sessions().mode(),
            "embeddings": {
                "mode": state.embedder.mode(),
                "fallbacks": state.embedder.fallback_count(),
            },
            "llm": llm_healthy,
        }
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[derive(Deserialize)]
struct WsIncoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    request: ChatRequest,
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    tracing::debug!("WebSocket client connected");
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                if handle_ws_message(&mut socket, &state, &text).await.is_err() {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
    tracing::debug!("WebSocket client disconnected");
}

async fn send_json(socket: &mut WebSocket, value: serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string())).await
}

async fn handle_ws_message(socket: &mut WebSocket, state: &Arc<AppState>, text: &str) -> Result<(), axum::Error> {
    let incoming: WsIncoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            return send_json(socket, json!({"type": "chat:error", "error": format!("Invalid message: {}", e)})).await;
        }
    };
    if incoming.kind != "chat:message" {
        tracing::debug!("Ignoring WebSocket message of type {}", incoming.kind);
        return Ok(());
    }

    let stream = match state.pipeline.stream(incoming.request) {
        Ok(stream) => stream,
        Err(e) => return send_json(socket, json!({"type": "chat:error", "error": e.to_string()})).await,
    };

    send_json(socket, json!({"type": "chat:sessionId", "sessionId": stream.session_id})).await?;

    // Returning early drops the receiver, which cancels generation.
    let mut events = stream.events;
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        let message = match event {
            StreamEvent::Chunk { chunk } => json!({"type": "chat:chunk", "chunk": chunk}),
            StreamEvent::Done { sources, .. } => json!({"type": "chat:done", "sources": sources}),
            StreamEvent::Error { error } => json!({"type": "chat:error", "error": error}),
        };
        send_json(socket, message).await?;
        if terminal {
            break;
        }
    }
    Ok(())
}
