//! Lifecycle event fan-out.
//!
//! Every event is appended to the durable log and pushed to the dashboard
//! broadcast channel. Emission never fails the caller: a full channel or a
//! store error is logged and dropped.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::adapters::SqliteStore;
use crate::domain::{Event, EventType, Trade};

/// Messages pushed to dashboard WebSocket clients
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Event(Event),
    TradeUpdate(Trade),
}

#[derive(Clone)]
pub struct EventSink {
    store: Arc<SqliteStore>,
    ws_tx: broadcast::Sender<WsMessage>,
}

impl EventSink {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        let (ws_tx, _) = broadcast::channel(1000);
        Self { store, ws_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.ws_tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<WsMessage> {
        self.ws_tx.clone()
    }

    /// Append to the audit log and push to live observers.
    pub async fn emit(
        &self,
        trade_id: Option<&str>,
        event_type: EventType,
        details: serde_json::Value,
    ) {
        let mut event = Event::new(trade_id, event_type, details);
        match self.store.append_event(&event).await {
            Ok(id) => event.event_id = Some(id),
            Err(e) => debug!(event_type = %event_type, error = %e, "event append failed"),
        }
        let _ = self.ws_tx.send(WsMessage::Event(event));
    }

    /// Push a trade snapshot to live observers (no log entry).
    pub fn push_trade(&self, trade: &Trade) {
        let _ = self.ws_tx.send(WsMessage::TradeUpdate(trade.clone()));
    }
}
