//! Health-check endpoint for the hosting platform.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub fn router(message: String) -> Router {
    Router::new().route(
        "/",
        get(move || {
            let message = message.clone();
            async move { message }
        }),
    )
}

/// Binds `addr` and serves the liveness route on its own task.
///
/// Binding happens before returning so a taken port fails startup.
pub async fn spawn(addr: SocketAddr, message: String) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Liveness endpoint listening on {local}");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(message)).await {
            error!("Liveness server stopped: {e}");
        }
    });
    Ok((local, handle))
}
