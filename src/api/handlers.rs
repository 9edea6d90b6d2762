use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use tracing::{error, warn};

use crate::api::state::AppState;
use crate::api::types::{ApiError, LimitQuery, StatusResponse, TradeDetailResponse};
use crate::error::CortoError;

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    error!(error = %e, "api handler failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: e.to_string(),
        }),
    )
}

pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ApiError>)> {
    let engine = state.engine.status().await;
    let pnl = state.store.pnl_summary().await.map_err(internal_error)?;
    let last_error = state.store.last_error_event().await.map_err(internal_error)?;

    let win_rate = if pnl.closed_trades > 0 {
        pnl.wins as f64 / pnl.closed_trades as f64 * 100.0
    } else {
        0.0
    };

    Ok(Json(StatusResponse {
        status: "running",
        now: chrono::Utc::now(),
        uptime_seconds: state.uptime_seconds(),
        active_trades: engine.active_trades,
        open_trades: engine.open_trades,
        max_open_trades: engine.max_open_trades,
        closed_trades: pnl.closed_trades,
        trades_today: pnl.trades_today,
        pnl_total_usdt: pnl.pnl_total_usdt,
        pnl_today_usdt: pnl.pnl_today_usdt,
        win_rate_pct: (win_rate * 10.0).round() / 10.0,
        error_trades: pnl.error_trades,
        ws_connected: *state.ws_connected.borrow(),
        last_error,
    }))
}

pub async fn get_trades(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    match state.store.list_trades(limit).await {
        Ok(trades) => Json(trades).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub async fn get_trade_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let trade = match state.store.get_trade(&id).await {
        Ok(Some(trade)) => trade,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError {
                    error: format!("trade {} not found", id),
                }),
            )
                .into_response()
        }
        Err(e) => return internal_error(e).into_response(),
    };
    match state.store.trade_events(&id).await {
        Ok(events) => Json(TradeDetailResponse { trade, events }).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.store.recent_events(limit).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cfg.redacted())
}

/// `POST /api/trades/{id}/close` — manual close of an OPEN trade.
pub async fn close_trade(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    warn!(trade_id = %id, "manual close requested via API");
    match state.engine.close_manual(&id).await {
        Ok(trade) => Json(trade).into_response(),
        Err(CortoError::TradeNotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError {
                error: format!("trade {} not found", id),
            }),
        )
            .into_response(),
        Err(CortoError::InvalidStateTransition { from, .. }) => (
            StatusCode::CONFLICT,
            Json(ApiError {
                error: format!("trade is {}, only open trades can be closed", from),
            }),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}
