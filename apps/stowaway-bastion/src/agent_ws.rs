//! The WebSocket endpoint agents dial into.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use stowaway_proto::{AgentFrame, BastionFrame};

use crate::hub;
use crate::routes::AppState;

/// Time limit for the first (auth) frame, so half-open upgrades cannot
/// hang the endpoint.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

pub async fn agent_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_agent(socket, state))
}

#[derive(Debug, thiserror::Error)]
enum AuthReadError {
    #[error("timed out waiting for auth")]
    TimedOut,
    #[error("socket closed before auth")]
    Closed,
    #[error("invalid auth message")]
    Invalid,
}

async fn serve_agent(mut socket: WebSocket, state: AppState) {
    let token = match read_auth(&mut socket).await {
        Ok(token) => token,
        Err(AuthReadError::TimedOut | AuthReadError::Closed) => return,
        Err(AuthReadError::Invalid) => {
            send_auth_error(&mut socket, "invalid auth message").await;
            return;
        }
    };

    let record = match state.store.agent_by_token(&token).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            send_auth_error(&mut socket, "invalid token").await;
            return;
        }
        Err(err) => {
            warn!("agent auth lookup failed: {err}");
            send_auth_error(&mut socket, "internal error").await;
            return;
        }
    };
    let agent_id = record.id.to_string();

    let (writer, mut receiver) = socket.split();
    let conn = state.hub.register(&agent_id, writer).await;
    let auth_ok = BastionFrame::AuthOk {
        agent_id: agent_id.clone(),
    };
    if conn.send_frame(&auth_ok).await.is_err() {
        state.hub.remove_conn(&conn).await;
        conn.close();
        return;
    }
    info!(agent_id = %agent_id, label = %record.label, "agent connected");

    let heartbeat = hub::spawn_heartbeat(conn.clone(), HEARTBEAT_PERIOD);
    hub::run_read_loop(&state.hub, &conn, &mut receiver).await;
    heartbeat.abort();
    info!(agent_id = %agent_id, "agent disconnected");
}

async fn read_auth(socket: &mut WebSocket) -> Result<String, AuthReadError> {
    let first = timeout(AUTH_DEADLINE, socket.recv())
        .await
        .map_err(|_| AuthReadError::TimedOut)?;
    let message = match first {
        Some(Ok(message)) => message,
        Some(Err(_)) | None => return Err(AuthReadError::Closed),
    };
    let text = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => {
            String::from_utf8(bytes).map_err(|_| AuthReadError::Invalid)?
        }
        Message::Close(_) => return Err(AuthReadError::Closed),
        _ => return Err(AuthReadError::Invalid),
    };
    match serde_json::from_str::<AgentFrame>(&text) {
        Ok(AgentFrame::Auth { token }) => Ok(token),
        _ => Err(AuthReadError::Invalid),
    }
}

async fn send_auth_error(socket: &mut WebSocket, reason: &str) {
    let frame = BastionFrame::AuthError {
        error: reason.to_string(),
    };
    if let Ok(json) = serde_json::to_string(&frame) {
        if let Err(err) = socket.send(Message::Text(json)).await {
            debug!("agent ws: write auth error: {err}");
        }
    }
}
