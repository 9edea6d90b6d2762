pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;
pub mod websocket;

pub use state::AppState;

use tokio::sync::watch;
use tracing::info;

use crate::error::Result;

/// Serve the dashboard API until `shutdown` fires.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    info!(host, port, "dashboard listening");

    axum::serve(listener, routes::create_router(state))
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}
