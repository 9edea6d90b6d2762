use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

use crate::adapters::SqliteStore;
use crate::config::AppConfig;
use crate::engine::{TradeEngine, WsMessage};

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<SqliteStore>,
    pub engine: Arc<TradeEngine>,
    /// User-data stream connection state
    pub ws_connected: watch::Receiver<bool>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        cfg: Arc<AppConfig>,
        store: Arc<SqliteStore>,
        engine: Arc<TradeEngine>,
        ws_connected: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cfg,
            store,
            engine,
            ws_connected,
            start_time: Utc::now(),
        }
    }

    /// Subscribe to live lifecycle events for `/ws` clients.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WsMessage> {
        self.engine.events().subscribe()
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.start_time).num_seconds()
    }
}
