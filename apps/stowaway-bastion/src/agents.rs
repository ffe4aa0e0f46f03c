//! Agent record management and the enriched listing.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use stowaway_proto::{AgentFrame, BastionFrame};

use crate::error::ApiError;
use crate::hub::AgentConn;
use crate::routes::AppState;

/// Time allowed for the opportunistic disk enrichment per connected agent.
const DISK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct AgentRow {
    id: Uuid,
    label: String,
    hosted_path: String,
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_free: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_total: Option<u64>,
}

pub async fn list_agents(State(state): State<AppState>) -> Result<Response, ApiError> {
    let records = state.store.list_agents().await?;
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let conn = state.hub.get(&record.id.to_string()).await;
        let connected = conn.is_some();
        let (disk_free, disk_total) = match conn {
            Some(conn) => fetch_disk(&conn).await,
            None => (None, None),
        };
        rows.push(AgentRow {
            id: record.id,
            label: record.label,
            hosted_path: record.hosted_path,
            connected,
            disk_free,
            disk_total,
        });
    }
    Ok(([(header::CACHE_CONTROL, "no-store")], Json(rows)).into_response())
}

/// Best-effort disk stats; any failure simply omits the fields.
async fn fetch_disk(conn: &AgentConn) -> (Option<u64>, Option<u64>) {
    let request_id = Uuid::new_v4().to_string();
    let frame = BastionFrame::GetDisk {
        request_id: request_id.clone(),
    };
    let raw = match conn.request(&request_id, &frame, DISK_TIMEOUT).await {
        Ok(raw) => raw,
        Err(_) => return (None, None),
    };
    match serde_json::from_str::<AgentFrame>(&raw) {
        Ok(AgentFrame::GetDisk {
            free_bytes,
            total_bytes,
            error: None,
            ..
        }) => (Some(free_bytes), Some(total_bytes)),
        _ => (None, None),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(default)]
    label: String,
    #[serde(default)]
    hosted_path: String,
}

pub async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Response, ApiError> {
    if request.label.is_empty() {
        return Err(ApiError::bad_request("label required"));
    }
    let hosted_path = if request.hosted_path.is_empty() {
        // The real path is whatever the agent serves when it runs.
        ".".to_string()
    } else {
        request.hosted_path
    };
    let token = generate_agent_token();
    let record = state
        .store
        .create_agent(&request.label, &token, &hosted_path)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.id,
            "label": record.label,
            "hosted_path": record.hosted_path,
            "token": token,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentRequest {
    label: Option<String>,
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<UpdateAgentRequest>,
) -> Result<StatusCode, ApiError> {
    let id = parse_agent_id(&agent_id)?;
    let label = match request.label.as_deref() {
        Some(label) if !label.is_empty() => label,
        _ => return Err(ApiError::bad_request("label required")),
    };
    if state.store.rename_agent(id, label).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

pub async fn delete_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_agent_id(&agent_id)?;
    // Deleting the record also disconnects any live session.
    state.hub.remove(&agent_id).await;
    if state.store.delete_agent(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found())
    }
}

fn parse_agent_id(agent_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(agent_id).map_err(|_| ApiError::not_found())
}

/// 32 bytes of OS randomness, URL-safe base64 without padding.
fn generate_agent_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
