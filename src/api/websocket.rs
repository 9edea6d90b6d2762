use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use tracing::{debug, error};

use crate::api::state::AppState;

/// `GET /ws` — live lifecycle event push for the dashboard.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Initial snapshot: current status plus the recent event history.
    let status = state.engine.status().await;
    let initial = json!({"type": "status", "data": status});
    if sender
        .send(Message::Text(initial.to_string()))
        .await
        .is_err()
    {
        return;
    }
    if let Ok(events) = state.store.recent_events(50).await {
        let history = json!({"type": "history", "data": events});
        if sender
            .send(Message::Text(history.to_string()))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut rx = state.subscribe_events();
    let send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize ws message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // The browser sends nothing we act on; drain until close.
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Close(_) = msg {
            break;
        }
    }

    send_task.abort();
    debug!("dashboard ws client disconnected");
}
