//! HTTP surface: health check, per-mailbox chat WebSocket and MCP
//!
//! Each WebSocket connection multiplexes three sources onto one socket: its
//! own outbound queue (reply chunks), the agent's broadcast channel (history
//! changes made by other connections) and control frames (pongs).

use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use rmcp::transport::streamable_http_server::StreamableHttpService;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistry, ZeroAgent};
use crate::chat::ChatEvent;
use crate::errors::{AppError, AppResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::ZeroMailServer;

#[derive(Clone)]
struct HttpState {
    agents: Arc<AgentRegistry>,
}

/// Build the application router
pub fn router(agents: Arc<AgentRegistry>, mcp: ZeroMailServer) -> Router {
    let mcp_service = StreamableHttpService::new(
        move || Ok(mcp.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    Router::new()
        .route("/health", get(health))
        .route("/agents/{mailbox}/chat", get(chat_socket))
        .nest_service("/mcp", mcp_service)
        .with_state(HttpState { agents })
}

/// Serve `app` on `bind` until `shutdown` is cancelled
pub async fn serve(bind: &str, app: Router, shutdown: CancellationToken) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| AppError::Internal(format!("failed to bind {bind}: {e}")))?;
    info!(bind, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Internal(format!("http server failed: {e}")))
}

async fn health(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let mailboxes: Vec<_> = state
        .agents
        .agents()
        .map(|agent| json!({ "mailbox_id": agent.mailbox_id(), "has_session": agent.has_session() }))
        .collect();
    Json(json!({ "status": "ok", "mailboxes": mailboxes }))
}

async fn chat_socket(
    Path(mailbox): Path<String>,
    State(state): State<HttpState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let agent = match state.agents.get(&mailbox) {
        Ok(agent) => agent,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| serve_chat_socket(socket, agent))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Frame to forward from the broadcast channel, skipping our own events
fn relay(connection: u64, event: ChatEvent) -> Option<ServerMessage> {
    (event.origin != Some(connection)).then_some(event.message)
}

async fn serve_chat_socket(socket: WebSocket, agent: Arc<ZeroAgent>) {
    let chat = Arc::clone(agent.chat());
    let (connection, mut events) = chat.connect();
    let (mut sink, mut stream) = socket.split();
    let (out, mut outbound) = mpsc::unbounded_channel::<ServerMessage>();
    let (control, mut controls) = mpsc::unbounded_channel::<Message>();
    info!(mailbox_id = %agent.mailbox_id(), connection, "chat socket connected");

    match chat.history() {
        Ok(messages) => {
            let _ = out.send(ServerMessage::ChatMessages { messages });
        }
        Err(e) => warn!(connection, error = %e, "failed to load chat history"),
    }

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(message) = controls.recv() => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(message) = outbound.recv() => message,
                event = events.recv() => match event {
                    Ok(event) => match relay(connection, event) {
                        Some(message) => message,
                        None => continue,
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connection, skipped, "chat socket lagged behind broadcast");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let payload = match serde_json::to_string(&frame) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(connection, error = %e, "failed to encode chat frame");
                    continue;
                }
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(e) => {
                debug!(connection, error = %e, "chat socket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(frame) => {
                    if let Err(e) = chat.handle_client_message(connection, frame, out.clone()) {
                        warn!(connection, error = %e, "chat frame failed");
                    }
                }
                Err(e) => warn!(connection, error = %e, "ignoring malformed chat frame"),
            },
            Message::Ping(payload) => {
                let _ = control.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Pong(_) => {}
        }
    }

    writer.abort();
    info!(mailbox_id = %agent.mailbox_id(), connection, "chat socket closed");
}
