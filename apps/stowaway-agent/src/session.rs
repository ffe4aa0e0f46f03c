//! One connection to the bastion: dial, authenticate, serve requests.

use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use stowaway_proto::{AgentFrame, BastionFrame};

use crate::fs_ops;

/// How a session ended, driving the reconnect loop's lockout counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The bastion rejected the token. Three in a row are fatal.
    AuthFailed,
    /// Any other disconnect: dial failure, read error, socket close.
    Disconnected,
}

/// Runs a single session against the bastion. Handlers run sequentially on
/// the reader, so replies to back-to-back requests keep their order.
pub async fn run_session(bastion_url: &str, token: &str, root: &Path) -> SessionEnd {
    let (stream, _) = match connect_async(bastion_url).await {
        Ok(connected) => connected,
        Err(err) => {
            warn!("dial {bastion_url}: {err}");
            return SessionEnd::Disconnected;
        }
    };
    let (mut write, mut read) = stream.split();

    let auth = AgentFrame::Auth {
        token: token.to_string(),
    };
    let Ok(auth_json) = serde_json::to_string(&auth) else {
        return SessionEnd::Disconnected;
    };
    if let Err(err) = write.send(Message::Text(auth_json)).await {
        warn!("auth send: {err}");
        return SessionEnd::Disconnected;
    }

    // Exactly one auth response precedes the request stream.
    let reply = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => break text,
                Err(_) => continue,
            },
            Some(Ok(Message::Close(_))) | None => {
                warn!("connection closed during auth");
                return SessionEnd::Disconnected;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!("auth read: {err}");
                return SessionEnd::Disconnected;
            }
        }
    };
    match serde_json::from_str::<BastionFrame>(&reply) {
        Ok(BastionFrame::AuthOk { agent_id }) => {
            info!(agent_id = %agent_id, "agent connected");
        }
        Ok(BastionFrame::AuthError { error }) => {
            warn!("auth failed: {error}");
            return SessionEnd::AuthFailed;
        }
        Ok(_) | Err(_) => {
            warn!("unexpected auth response");
            return SessionEnd::Disconnected;
        }
    }

    while let Some(next) = read.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!("read: {err}");
                break;
            }
        };
        let frame = match serde_json::from_str::<BastionFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        let reply = match frame {
            BastionFrame::ListDir { request_id, path } => {
                fs_ops::list_dir(root, request_id, &path)
            }
            BastionFrame::ReadFile {
                request_id,
                path,
                offset,
                size,
            } => fs_ops::read_file(root, request_id, &path, offset, size),
            BastionFrame::WriteFile {
                request_id,
                path,
                data,
            } => fs_ops::write_file(root, request_id, &path, &data),
            BastionFrame::GetMeta { request_id, path } => {
                fs_ops::get_meta(root, request_id, &path)
            }
            BastionFrame::DeleteFile { request_id, path } => {
                fs_ops::delete_file(root, request_id, &path)
            }
            BastionFrame::GetDisk { request_id } => fs_ops::get_disk(root, request_id),
            BastionFrame::AuthOk { .. } | BastionFrame::AuthError { .. } => continue,
        };
        let Ok(reply_json) = serde_json::to_string(&reply) else {
            continue;
        };
        if let Err(err) = write.send(Message::Text(reply_json)).await {
            warn!("write: {err}");
            break;
        }
    }
    SessionEnd::Disconnected
}
