pub mod handlers;
pub mod hdhr;
pub mod m3u;
pub mod routes;
pub mod ssdp;
pub mod state;

use std::net::SocketAddr;

pub use state::AppState;

/// Server error types for proper error handling
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server runtime error: {0}")]
    RuntimeError(String),
}

/// Start the HTTP server on the configured bind address and port.
///
/// Binds all interfaces by default: the tuner has to be reachable by Plex
/// and IPTV players elsewhere on the LAN.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.port();
    let bind_address = state.config.bind_address.clone();
    let app = routes::create_router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| ServerError::RuntimeError(format!("bad bind address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
