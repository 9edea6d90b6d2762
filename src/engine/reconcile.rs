//! Startup and post-reconnect reconciliation.
//!
//! The venue is authoritative. For every persisted non-terminal trade the
//! engine queries the real order/position state and corrects the store,
//! re-arming missing exit legs and resolving fills that happened while the
//! process was down or the stream was disconnected. Disagreements are
//! recorded as `error` events.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::domain::{EventType, ExitType, Trade, TradeStatus};
use crate::error::Result;

use super::TradeEngine;

impl TradeEngine {
    /// Load persisted active trades into the registry and reconcile them
    /// against the venue. Called once at startup, before the user stream
    /// begins delivering events.
    pub async fn reconcile_startup(self: &Arc<Self>) -> Result<()> {
        let db_trades = self.store.load_active_trades().await?;
        if db_trades.is_empty() {
            info!("reconciliation: no active trades in store");
            return Ok(());
        }
        info!(count = db_trades.len(), "reconciling persisted trades");

        {
            let mut reg = self.registry.lock().await;
            for t in db_trades {
                let trade_id = t.trade_id.clone();
                if let Some(id) = t.entry_order_id {
                    if t.status == TradeStatus::Opening
                        || t.status == TradeStatus::SignalReceived
                    {
                        reg.by_entry.insert((t.pair.clone(), id), trade_id.clone());
                    }
                }
                if let Some(id) = t.tp_order_id {
                    reg.by_tp.insert((t.pair.clone(), id), trade_id.clone());
                }
                if let Some(id) = t.sl_order_id {
                    reg.by_sl.insert((t.pair.clone(), id), trade_id.clone());
                }
                reg.trades.insert(trade_id, Arc::new(Mutex::new(t)));
            }
        }

        self.reconcile_active().await
    }

    /// Re-check every in-memory non-terminal trade against the venue. Also
    /// runs after each user-stream reconnect, when fills may have been
    /// missed.
    pub async fn reconcile_active(self: &Arc<Self>) -> Result<()> {
        let venue_pairs: HashSet<String> = match self.venue.all_positions().await {
            Ok(positions) => positions.into_iter().map(|p| p.symbol).collect(),
            Err(e) => {
                error!(error = %e, "reconciliation: could not fetch positions");
                HashSet::new()
            }
        };

        let trades: Vec<(String, Arc<Mutex<Trade>>)> = {
            let reg = self.registry.lock().await;
            reg.trades
                .iter()
                .map(|(id, arc)| (id.clone(), arc.clone()))
                .collect()
        };

        let mut db_open_pairs: HashSet<String> = HashSet::new();

        for (trade_id, trade) in &trades {
            let status = trade.lock().await.status;
            let outcome = match status {
                TradeStatus::Open => self.reconcile_open(trade_id, trade, &venue_pairs).await,
                TradeStatus::Opening | TradeStatus::SignalReceived => {
                    self.reconcile_opening(trade_id, trade).await
                }
                TradeStatus::Closing => {
                    self.reconcile_closing(trade_id, trade, &venue_pairs).await
                }
                _ => Ok(()),
            };

            match outcome {
                Ok(()) => {
                    let t = trade.lock().await;
                    info!(trade_id = %t.short_id(), pair = %t.pair, status = %t.status, "reconciled");
                    if t.status == TradeStatus::Open {
                        db_open_pairs.insert(t.pair.clone());
                    }
                }
                Err(e) => {
                    error!(trade_id = %&trade_id[..8], error = %e, "reconciliation failed");
                    self.events
                        .emit(
                            Some(trade_id.as_str()),
                            EventType::Error,
                            json!({"msg": format!("reconciliation error: {}", e)}),
                        )
                        .await;
                }
            }
        }

        for pair in venue_pairs.difference(&db_open_pairs) {
            warn!(
                pair = %pair,
                "position open at venue with no corresponding trade, review manually"
            );
        }

        Ok(())
    }

    /// OPEN trade: verify the position exists, resolve any exit leg that
    /// already filled, re-arm missing legs.
    async fn reconcile_open(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        venue_pairs: &HashSet<String>,
    ) -> Result<()> {
        let (pair, tp_id, sl_id) = {
            let t = trade.lock().await;
            (t.pair.clone(), t.tp_order_id, t.sl_order_id)
        };

        // An exit may have filled while we were away (stream gap, restart).
        for (order_id, exit_type) in [(tp_id, ExitType::Tp), (sl_id, ExitType::Sl)] {
            let Some(order_id) = order_id else { continue };
            if let Ok(state) = self.venue.query_order(&pair, order_id).await {
                if state.is_filled() {
                    info!(
                        trade_id = %&trade_id[..8],
                        order_id,
                        exit = %exit_type,
                        "exit filled during gap, resolving"
                    );
                    self.resolve_reconciled_exit(trade_id, trade, state.avg_price, exit_type)
                        .await;
                    return Ok(());
                }
            }
        }

        if !venue_pairs.contains(&pair) {
            // Position is gone but neither exit order reports a fill: it was
            // closed outside the engine.
            warn!(
                trade_id = %&trade_id[..8],
                pair = %pair,
                "OPEN in store but no position at venue, closing as manual"
            );
            self.events
                .emit(
                    Some(trade_id),
                    EventType::Error,
                    json!({"msg": "position closed externally"}),
                )
                .await;
            let exit_price = self.last_executed_price(&pair, &[tp_id, sl_id]).await;
            self.resolve_reconciled_exit(trade_id, trade, exit_price, ExitType::Manual)
                .await;
            return Ok(());
        }

        let open_ids = self.venue.open_order_ids(&pair).await?;

        let tp_missing = tp_id.map(|id| !open_ids.contains(&id)).unwrap_or(true);
        let sl_missing = sl_id.map(|id| !open_ids.contains(&id)).unwrap_or(true);

        if tp_missing && sl_missing {
            warn!(trade_id = %&trade_id[..8], "TP and SL missing, re-arming both");
            self.arm_exits(trade_id, trade).await;
        } else if tp_missing {
            warn!(trade_id = %&trade_id[..8], "TP missing, re-arming");
            self.rearm_leg(trade_id, trade, ExitType::Tp).await;
        } else if sl_missing {
            warn!(trade_id = %&trade_id[..8], "SL missing, re-arming");
            self.rearm_leg(trade_id, trade, ExitType::Sl).await;
        }

        Ok(())
    }

    /// OPENING (or never-started) trade: find out whether the entry filled
    /// while the process was down.
    async fn reconcile_opening(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
    ) -> Result<()> {
        let (pair, entry_order_id) = {
            let t = trade.lock().await;
            (t.pair.clone(), t.entry_order_id)
        };

        let Some(order_id) = entry_order_id else {
            warn!(
                trade_id = %&trade_id[..8],
                "no entry order was placed, marking not executed"
            );
            self.mark_not_executed(trade, "no entry order at reconciliation")
                .await;
            return Ok(());
        };

        let state = match self.venue.query_order(&pair, order_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    trade_id = %&trade_id[..8],
                    order_id,
                    error = %e,
                    "entry order unknown at venue, marking not executed"
                );
                self.mark_not_executed(trade, "entry order not found at reconciliation")
                    .await;
                return Ok(());
            }
        };

        if state.is_filled() {
            info!(
                trade_id = %&trade_id[..8],
                price = %state.avg_price,
                "entry filled while down, promoting to OPEN"
            );
            {
                let mut t = trade.lock().await;
                t.entry_price = Some(state.avg_price);
                if t.entry_fill_ts.is_none() {
                    t.entry_fill_ts = Some(Utc::now());
                }
                if t.status == TradeStatus::SignalReceived {
                    let _ = t.transition(TradeStatus::Opening);
                }
                t.transition(TradeStatus::Open)?;
                self.store.save_trade(&t).await?;
            }
            self.registry
                .lock()
                .await
                .by_entry
                .remove(&(pair.clone(), order_id));
            self.events
                .emit(
                    Some(trade_id),
                    EventType::EntryFill,
                    json!({
                        "orderId": order_id,
                        "price": state.avg_price,
                        "reconcile": true,
                    }),
                )
                .await;
            self.arm_exits(trade_id, trade).await;
        } else {
            if matches!(state.status.as_str(), "NEW" | "PARTIALLY_FILLED") {
                if let Err(e) = self.venue.cancel_order(&pair, order_id).await {
                    warn!(order_id, error = %e, "cancel stale entry failed");
                }
            }
            warn!(
                trade_id = %&trade_id[..8],
                status = %state.status,
                "entry not filled, marking not executed"
            );
            self.mark_not_executed(trade, "entry unfilled at reconciliation")
                .await;
        }

        Ok(())
    }

    /// CLOSING trade: the process died mid-exit. Position gone means the
    /// close completed; still present means the close never landed.
    async fn reconcile_closing(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        venue_pairs: &HashSet<String>,
    ) -> Result<()> {
        let pair = trade.lock().await.pair.clone();

        if !venue_pairs.contains(&pair) {
            {
                let mut t = trade.lock().await;
                if t.exit_fill_ts.is_none() {
                    t.exit_fill_ts = Some(Utc::now());
                }
                if t.exit_type.is_none() {
                    t.exit_type = Some(ExitType::Manual);
                }
                if t.exit_price.is_none() {
                    t.exit_price = Some(Decimal::ZERO);
                }
                t.touch();
                self.store.save_trade(&t).await?;
            }
            self.finalize_close(trade).await;
        } else {
            // The venue still holds the position: the recorded exit never
            // completed. Store state is corrected back to OPEN (venue is
            // authoritative) and both legs re-checked.
            warn!(
                trade_id = %&trade_id[..8],
                pair = %pair,
                "CLOSING but position still at venue, restoring OPEN"
            );
            self.events
                .emit(
                    Some(trade_id),
                    EventType::Error,
                    json!({"msg": "closing interrupted, restored to open"}),
                )
                .await;
            {
                let mut t = trade.lock().await;
                t.status = TradeStatus::Open;
                t.exit_type = None;
                t.exit_price = None;
                t.exit_fill_ts = None;
                t.touch();
                self.store.save_trade(&t).await?;
            }
            self.reconcile_open(trade_id, trade, venue_pairs).await?;
        }

        Ok(())
    }

    /// Exit resolution for a fill observed through reconciliation rather
    /// than the stream: cancel whatever leg is still resident, finalize.
    async fn resolve_reconciled_exit(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        exit_price: Decimal,
        exit_type: ExitType,
    ) {
        {
            let mut t = trade.lock().await;
            if t.status != TradeStatus::Open {
                return;
            }
            if t.transition(TradeStatus::Closing).is_err() {
                return;
            }
            t.exit_price = Some(exit_price);
            t.exit_fill_ts = Some(Utc::now());
            t.exit_type = Some(exit_type);
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist CLOSING failed");
            }
        }
        let event_type = match exit_type {
            ExitType::Tp => EventType::TpFill,
            ExitType::Sl => EventType::SlFill,
            _ => EventType::Cancel,
        };
        self.events
            .emit(
                Some(trade_id),
                event_type,
                json!({"price": exit_price, "reconcile": true}),
            )
            .await;

        self.cancel_exit_leg(trade, ExitType::Tp).await;
        self.cancel_exit_leg(trade, ExitType::Sl).await;
        self.finalize_close(trade).await;
    }

    /// Re-arm one missing exit leg on an OPEN trade.
    async fn rearm_leg(self: &Arc<Self>, trade_id: &str, trade: &Arc<Mutex<Trade>>, leg: ExitType) {
        let (pair, qty, entry_price) = {
            let t = trade.lock().await;
            match (t.entry_quantity, t.entry_price) {
                (Some(q), Some(p)) => (t.pair.clone(), q, p),
                _ => return,
            }
        };
        match leg {
            ExitType::Tp => {
                self.arm_tp(trade_id, trade, &pair, qty, entry_price).await;
            }
            ExitType::Sl => {
                self.arm_sl(trade_id, trade, &pair, qty, entry_price).await;
            }
            _ => {}
        }
    }

    /// Best-effort exit price for a position closed outside the engine: the
    /// average price of whichever recorded exit order last executed.
    async fn last_executed_price(&self, pair: &str, order_ids: &[Option<i64>]) -> Decimal {
        for id in order_ids.iter().flatten() {
            if let Ok(state) = self.venue.query_order(pair, *id).await {
                if state.executed_qty > Decimal::ZERO && state.avg_price > Decimal::ZERO {
                    return state.avg_price;
                }
            }
        }
        Decimal::ZERO
    }

    /// Watch the user-stream connection state; after every reconnect that
    /// follows a real drop, run a targeted reconciliation (fills may have
    /// been missed during the gap).
    pub async fn run_reconnect_monitor(
        self: Arc<Self>,
        mut connected: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut was_connected = *connected.borrow();
        let mut had_gap = false;

        loop {
            tokio::select! {
                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_connected = *connected.borrow();
                    if now_connected && !was_connected {
                        self.events
                            .emit(None, EventType::WsConnect, json!({}))
                            .await;
                        if had_gap {
                            info!("stream reconnected after gap, reconciling active trades");
                            if let Err(e) = self.reconcile_active().await {
                                error!(error = %e, "post-reconnect reconciliation failed");
                            }
                        }
                    } else if !now_connected && was_connected {
                        had_gap = true;
                        self.events
                            .emit(None, EventType::WsDisconnect, json!({}))
                            .await;
                    }
                    was_connected = now_connected;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
