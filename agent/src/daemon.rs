//! Binds the local control socket and serves one [`crate::rpc::AgentRpcHandler`]
//! connection per accepted client. Grounded on spec.md §6's socket path/mode
//! and `crates/auth/src/token_store.rs`'s use of `PermissionsExt` for
//! restrictive file modes.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::ipc;
use crate::rpc::AgentRpcHandler;
use crate::state::AgentState;

pub const DEFAULT_SOCKET_PATH: &str = "/run/not-my-board-agent.sock";

/// Binds `socket_path`, setting it to mode `0660` so members of the
/// `not-my-board` group can reach the daemon without root. Group ownership
/// itself is left to the installer (packaging sets it up once at install
/// time); failure to chmod is logged but not fatal, since a fresh
/// development checkout may run as a single unprivileged user anyway.
pub async fn serve(socket_path: &Path, state: Arc<AgentState>) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;

    match std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660)) {
        Ok(()) => {}
        Err(e) => warn!(path = %socket_path.display(), error = %e, "failed to chmod control socket"),
    }

    info!(path = %socket_path.display(), "control socket listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let handler_state = state.clone();
        tokio::spawn(async move {
            let channel = ipc::wrap(stream);
            channel.set_handler(Arc::new(AgentRpcHandler { state: handler_state })).await;
            // The channel's own serve task (spawned inside ipc::wrap) drives
            // this connection; nothing left to do here but let it run.
        });
    }
}
