//! Host-side agent: dials the bastion, authenticates with a token, and
//! serves filesystem operations scoped to a single hosted root directory.

pub mod disk;
pub mod fs_ops;
pub mod safe_path;
pub mod session;
pub mod setup;

/// Default bastion WebSocket endpoint when none is configured.
pub const DEFAULT_BASTION_URL: &str = "ws://localhost:8080/ws/agent";
