//! RPC listeners
//!
//! Network clients arrive over TCP and are untrusted; local tools arrive
//! over a Unix socket and are trusted. Each accepted connection runs in its
//! own task.

mod connection;

pub use connection::handle_connection;

use std::path::Path;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info};

use crate::preprocessor::RpcPreprocessor;
use crate::types::Result;

/// Accept untrusted clients until the listener fails
pub async fn serve_tcp(preprocessor: Arc<RpcPreprocessor>, listener: TcpListener) -> Result<()> {
    info!("RPC listening on {} (network, untrusted)", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                let preprocessor = Arc::clone(&preprocessor);
                tokio::spawn(async move {
                    handle_connection(preprocessor, stream, true, addr.to_string()).await;
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Accept trusted local clients until the listener fails
pub async fn serve_unix(preprocessor: Arc<RpcPreprocessor>, listener: UnixListener) -> Result<()> {
    info!("RPC listening on {:?} (local, trusted)", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let preprocessor = Arc::clone(&preprocessor);
                tokio::spawn(async move {
                    handle_connection(preprocessor, stream, false, "local".to_string()).await;
                });
            }
            Err(e) => {
                error!("Error accepting local connection: {:?}", e);
            }
        }
    }
}

/// Bind the local socket, replacing a stale socket file from a previous run
pub fn bind_unix(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => info!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}
