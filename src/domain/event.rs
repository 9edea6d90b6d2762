use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event kinds appended to the event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Signal,
    EntrySent,
    EntryFill,
    TpPlaced,
    SlPlaced,
    TpFill,
    SlFill,
    Timeout,
    Cancel,
    Error,
    WsConnect,
    WsDisconnect,
    Startup,
    Shutdown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Signal => "signal",
            EventType::EntrySent => "entry_sent",
            EventType::EntryFill => "entry_fill",
            EventType::TpPlaced => "tp_placed",
            EventType::SlPlaced => "sl_placed",
            EventType::TpFill => "tp_fill",
            EventType::SlFill => "sl_fill",
            EventType::Timeout => "timeout",
            EventType::Cancel => "cancel",
            EventType::Error => "error",
            EventType::WsConnect => "ws_connect",
            EventType::WsDisconnect => "ws_disconnect",
            EventType::Startup => "startup",
            EventType::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append-only audit record. `event_id` is assigned by the store and is
/// monotonic; `trade_id` is empty for process-global events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Option<i64>,
    pub trade_id: Option<String>,
    pub event_type: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        trade_id: Option<&str>,
        event_type: EventType,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_id: None,
            trade_id: trade_id.map(str::to_string),
            event_type: event_type.as_str().to_string(),
            details,
            timestamp: Utc::now(),
        }
    }
}
