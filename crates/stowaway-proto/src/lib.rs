//! Shared protocol definitions for the agent ↔ bastion WebSocket fabric.
//! Keeping this in a dedicated crate lets both binaries (and any future
//! bindings) agree on frame shapes without pulling in runtime code.
//!
//! Every frame is a UTF-8 JSON object carried in a WebSocket text message.
//! The `type` field selects the frame; all non-auth frames also carry a
//! `request_id` that pairs a reply with its request across the duplex
//! stream. Replies echo the `type` and `request_id` of their request, so
//! the decoding side is picked by direction: the bastion decodes inbound
//! frames as [`AgentFrame`], the agent decodes inbound frames as
//! [`BastionFrame`].

use serde::{Deserialize, Serialize};

/// One entry in a directory listing.
///
/// `mtime` is RFC 3339 with offset and second precision; it is empty when
/// the per-entry stat failed (a listing never aborts on one bad entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: String,
}

/// Frames sent by the bastion to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BastionFrame {
    /// Successful agent authentication.
    AuthOk { agent_id: String },
    /// Failed agent authentication; the connection is closed afterwards.
    AuthError { error: String },
    /// List a directory (path relative to the agent's hosted root).
    ListDir { request_id: String, path: String },
    /// Read a file, optionally a byte range.
    ///
    /// Both `offset` and `size` zero means the whole file; `offset` past
    /// the end yields empty data; `size` zero with a nonzero `offset`
    /// means "to end of file".
    ReadFile {
        request_id: String,
        path: String,
        #[serde(default, skip_serializing_if = "is_zero")]
        offset: u64,
        #[serde(default, skip_serializing_if = "is_zero")]
        size: u64,
    },
    /// Write a file; `data` is standard base64 with padding.
    WriteFile {
        request_id: String,
        path: String,
        data: String,
    },
    /// Stat a path.
    GetMeta { request_id: String, path: String },
    /// Remove a file or directory tree.
    DeleteFile { request_id: String, path: String },
    /// Free/total bytes of the volume holding the hosted root.
    GetDisk { request_id: String },
}

/// Frames sent by an agent to the bastion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// First frame after connect; the token is the sole credential.
    Auth { token: String },
    ListDir {
        request_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        entries: Vec<FileEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ReadFile {
        request_id: String,
        /// Standard base64 with padding; empty for an empty read.
        #[serde(default, skip_serializing_if = "String::is_empty")]
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WriteFile {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetMeta {
        request_id: String,
        #[serde(default)]
        size: u64,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        mtime: String,
        #[serde(default)]
        is_dir: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DeleteFile {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetDisk {
        request_id: String,
        #[serde(default)]
        free_bytes: u64,
        #[serde(default)]
        total_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl AgentFrame {
    /// The correlation id carried by this frame, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentFrame::Auth { .. } => None,
            AgentFrame::ListDir { request_id, .. }
            | AgentFrame::ReadFile { request_id, .. }
            | AgentFrame::WriteFile { request_id, .. }
            | AgentFrame::GetMeta { request_id, .. }
            | AgentFrame::DeleteFile { request_id, .. }
            | AgentFrame::GetDisk { request_id, .. } => Some(request_id),
        }
    }
}

/// The minimal decode the bastion read loop performs on an inbound frame
/// before looking up the pending slot. Frames without a `request_id`
/// decode to an empty id and are dropped by the lookup.
#[derive(Debug, Default, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub request_id: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}
