use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState, websocket::websocket_handler};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/trades", get(handlers::get_trades))
        .route("/api/trades/:id", get(handlers::get_trade_by_id))
        .route("/api/trades/:id/close", post(handlers::close_trade))
        .route("/api/events", get(handlers::get_events))
        .route("/api/config", get(handlers::get_config))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(cors)
}
