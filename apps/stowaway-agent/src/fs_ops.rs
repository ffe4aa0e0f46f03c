//! Filesystem handlers behind the safe-path gate.
//!
//! Every handler reports failure as a plain string in the reply `error`
//! field; a handler error never tears the connection down. Payloads are
//! carried whole (the protocol is atomic per request), so the practical
//! size bound is the agent's memory.

use std::fs;
use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Local, SecondsFormat};
use stowaway_proto::{AgentFrame, FileEntry};

use crate::disk;
use crate::safe_path;

const INVALID_PATH: &str = "invalid path";

pub fn list_dir(root: &Path, request_id: String, path: &str) -> AgentFrame {
    let Some(abs) = safe_path::resolve(root, path) else {
        return AgentFrame::ListDir {
            request_id,
            entries: Vec::new(),
            error: Some(INVALID_PATH.into()),
        };
    };
    let read_dir = match fs::read_dir(&abs) {
        Ok(read_dir) => read_dir,
        Err(err) => {
            return AgentFrame::ListDir {
                request_id,
                entries: Vec::new(),
                error: Some(err.to_string()),
            };
        }
    };
    let mut entries = Vec::new();
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        // A failed per-entry stat yields zero size and empty mtime
        // rather than aborting the listing.
        let (is_dir, size, mtime) = match entry.metadata() {
            Ok(meta) => (
                meta.is_dir(),
                if meta.is_dir() { 0 } else { meta.len() },
                format_mtime(&meta),
            ),
            Err(_) => (false, 0, String::new()),
        };
        entries.push(FileEntry {
            name,
            is_dir,
            size,
            mtime,
        });
    }
    AgentFrame::ListDir {
        request_id,
        entries,
        error: None,
    }
}

pub fn read_file(root: &Path, request_id: String, path: &str, offset: u64, size: u64) -> AgentFrame {
    let Some(abs) = safe_path::resolve(root, path) else {
        return read_error(request_id, INVALID_PATH.into());
    };
    let mut data = match fs::read(&abs) {
        Ok(data) => data,
        Err(err) => return read_error(request_id, err.to_string()),
    };
    if offset > 0 || size > 0 {
        let len = data.len() as u64;
        if offset >= len {
            data.clear();
        } else {
            let end = if size == 0 {
                len
            } else {
                offset.saturating_add(size).min(len)
            };
            data = data[offset as usize..end as usize].to_vec();
        }
    }
    AgentFrame::ReadFile {
        request_id,
        data: BASE64.encode(&data),
        error: None,
    }
}

pub fn write_file(root: &Path, request_id: String, path: &str, data: &str) -> AgentFrame {
    let error = match try_write(root, path, data) {
        Ok(()) => None,
        Err(msg) => Some(msg),
    };
    AgentFrame::WriteFile { request_id, error }
}

fn try_write(root: &Path, path: &str, data: &str) -> Result<(), String> {
    let abs = safe_path::resolve(root, path).ok_or_else(|| INVALID_PATH.to_string())?;
    let bytes = BASE64.decode(data).map_err(|err| err.to_string())?;
    let parent = abs.parent().unwrap_or(root);
    create_dirs(parent).map_err(|err| err.to_string())?;
    // Write to a temp file in the target directory and rename into place
    // so an overwrite is atomic and a crash never leaves a partial file.
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| err.to_string())?;
    tmp.write_all(&bytes).map_err(|err| err.to_string())?;
    tmp.flush().map_err(|err| err.to_string())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))
            .map_err(|err| err.to_string())?;
    }
    tmp.persist(&abs).map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(unix)]
fn create_dirs(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

#[cfg(not(unix))]
fn create_dirs(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

pub fn get_meta(root: &Path, request_id: String, path: &str) -> AgentFrame {
    let Some(abs) = safe_path::resolve(root, path) else {
        return meta_error(request_id, INVALID_PATH.into());
    };
    match fs::metadata(&abs) {
        Ok(meta) => AgentFrame::GetMeta {
            request_id,
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: format_mtime(&meta),
            is_dir: meta.is_dir(),
            error: None,
        },
        Err(err) => meta_error(request_id, err.to_string()),
    }
}

pub fn delete_file(root: &Path, request_id: String, path: &str) -> AgentFrame {
    let error = match try_delete(root, path) {
        Ok(()) => None,
        Err(msg) => Some(msg),
    };
    AgentFrame::DeleteFile { request_id, error }
}

fn try_delete(root: &Path, path: &str) -> Result<(), String> {
    let abs = safe_path::resolve(root, path).ok_or_else(|| INVALID_PATH.to_string())?;
    let meta = match fs::symlink_metadata(&abs) {
        Ok(meta) => meta,
        // Deleting something that is already gone is not an error.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.to_string()),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(&abs)
    } else {
        fs::remove_file(&abs)
    };
    result.map_err(|err| err.to_string())
}

pub fn get_disk(root: &Path, request_id: String) -> AgentFrame {
    match disk::volume_space(root) {
        Ok((free_bytes, total_bytes)) => AgentFrame::GetDisk {
            request_id,
            free_bytes,
            total_bytes,
            error: None,
        },
        Err(err) => AgentFrame::GetDisk {
            request_id,
            free_bytes: 0,
            total_bytes: 0,
            error: Some(err.to_string()),
        },
    }
}

fn format_mtime(meta: &fs::Metadata) -> String {
    meta.modified()
        .ok()
        .map(|mtime| {
            DateTime::<Local>::from(mtime).to_rfc3339_opts(SecondsFormat::Secs, true)
        })
        .unwrap_or_default()
}

fn read_error(request_id: String, message: String) -> AgentFrame {
    AgentFrame::ReadFile {
        request_id,
        data: String::new(),
        error: Some(message),
    }
}

fn meta_error(request_id: String, message: String) -> AgentFrame {
    AgentFrame::GetMeta {
        request_id,
        size: 0,
        mtime: String::new(),
        is_dir: false,
        error: Some(message),
    }
}
