use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Event, Trade};

/// `GET /api/status` response
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub now: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub active_trades: usize,
    pub open_trades: usize,
    pub max_open_trades: usize,
    pub closed_trades: i64,
    pub trades_today: i64,
    pub pnl_total_usdt: Decimal,
    pub pnl_today_usdt: Decimal,
    pub win_rate_pct: f64,
    pub error_trades: i64,
    pub ws_connected: bool,
    pub last_error: Option<Event>,
}

/// `GET /api/trades/{id}` response: the trade plus its audit trail
#[derive(Debug, Clone, Serialize)]
pub struct TradeDetailResponse {
    pub trade: Trade,
    pub events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

/// Error body for non-2xx responses
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
}
