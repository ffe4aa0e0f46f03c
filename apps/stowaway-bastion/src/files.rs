//! HTTP → WebSocket proxy: each handler turns one HTTP call into a
//! correlated round-trip on the target agent's connection.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use stowaway_proto::{AgentFrame, BastionFrame};

use crate::error::ApiError;
use crate::hub::AgentConn;
use crate::routes::AppState;

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
pub struct FilesQuery {
    path: Option<String>,
    download: Option<String>,
}

impl FilesQuery {
    fn path(&self) -> String {
        match self.path.as_deref() {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => ".".to_string(),
        }
    }
}

async fn conn_for(state: &AppState, agent_id: &str) -> Result<Arc<AgentConn>, ApiError> {
    state
        .hub
        .get(agent_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "agent not connected"))
}

/// One correlated round-trip. Transport failures map to 502; a reply of
/// an unexpected shape is treated the same way.
async fn round_trip(conn: &AgentConn, build: impl FnOnce(String) -> BastionFrame) -> Result<AgentFrame, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let frame = build(request_id.clone());
    let raw = conn.request(&request_id, &frame, PROXY_TIMEOUT).await?;
    serde_json::from_str(&raw).map_err(|_| ApiError::bad_gateway("invalid response"))
}

/// A non-empty `error` in an agent reply is the operator's fault or the
/// remote filesystem's; either way it surfaces as 400.
fn reply_error(error: Option<String>) -> Result<(), ApiError> {
    match error {
        Some(message) if !message.is_empty() => Err(ApiError::bad_request(message)),
        _ => Ok(()),
    }
}

pub async fn files_get(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Response, ApiError> {
    let conn = conn_for(&state, &agent_id).await?;
    let path = query.path();
    if query.download.as_deref() == Some("1") {
        proxy_read_file(&conn, path).await
    } else {
        proxy_list_dir(&conn, path).await
    }
}

pub async fn files_put(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<FilesQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let conn = conn_for(&state, &agent_id).await?;
    let path = query.path();
    let data = BASE64.encode(&body);
    let reply = round_trip(&conn, |request_id| BastionFrame::WriteFile {
        request_id,
        path,
        data,
    })
    .await?;
    match reply {
        AgentFrame::WriteFile { error, .. } => {
            reply_error(error)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::bad_gateway("invalid response")),
    }
}

pub async fn files_delete(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Response, ApiError> {
    let conn = conn_for(&state, &agent_id).await?;
    let path = query.path();
    let reply = round_trip(&conn, |request_id| BastionFrame::DeleteFile {
        request_id,
        path,
    })
    .await?;
    match reply {
        AgentFrame::DeleteFile { error, .. } => {
            reply_error(error)?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::bad_gateway("invalid response")),
    }
}

pub async fn meta_get(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<FilesQuery>,
) -> Result<Response, ApiError> {
    let conn = conn_for(&state, &agent_id).await?;
    let path = query.path();
    let reply = round_trip(&conn, |request_id| BastionFrame::GetMeta {
        request_id,
        path,
    })
    .await?;
    match reply {
        AgentFrame::GetMeta {
            size,
            mtime,
            is_dir,
            error,
            ..
        } => {
            reply_error(error)?;
            Ok(Json(json!({
                "size": size,
                "mtime": mtime,
                "is_dir": is_dir,
            }))
            .into_response())
        }
        _ => Err(ApiError::bad_gateway("invalid response")),
    }
}

async fn proxy_list_dir(conn: &AgentConn, path: String) -> Result<Response, ApiError> {
    let reply = round_trip(conn, |request_id| BastionFrame::ListDir {
        request_id,
        path,
    })
    .await?;
    match reply {
        AgentFrame::ListDir { entries, error, .. } => {
            reply_error(error)?;
            Ok(Json(entries).into_response())
        }
        _ => Err(ApiError::bad_gateway("invalid response")),
    }
}

async fn proxy_read_file(conn: &AgentConn, path: String) -> Result<Response, ApiError> {
    let reply = round_trip(conn, |request_id| BastionFrame::ReadFile {
        request_id,
        path,
        offset: 0,
        size: 0,
    })
    .await?;
    match reply {
        AgentFrame::ReadFile { data, error, .. } => {
            reply_error(error)?;
            let bytes = BASE64
                .decode(data.as_bytes())
                .map_err(|_| ApiError::bad_gateway("invalid data"))?;
            Ok(([(header::CONTENT_DISPOSITION, "attachment")], bytes).into_response())
        }
        _ => Err(ApiError::bad_gateway("invalid response")),
    }
}
