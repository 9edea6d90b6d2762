//! Trade Engine: per-trade state machine and dispatcher.
//!
//! One lifecycle task per accepted signal drives the trade through
//! `SIGNAL_RECEIVED → OPENING → OPEN → CLOSING → CLOSED`, while the dispatch
//! loop routes user-stream order updates to the owning trade. Exit
//! resolution is serialized by a per-trade mutex: the first of {TP fill, SL
//! fill, timeout, manual close} wins, later events observe the terminal
//! state and are ignored.

pub mod events;
pub mod math;
mod reconcile;

pub use events::{EventSink, WsMessage};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapters::binance_rest::CODE_WOULD_TRIGGER;
use crate::adapters::{BinanceClient, OrderUpdate, SqliteStore};
use crate::config::{AppConfig, EntryOrderType, TimeoutOrderType};
use crate::domain::{EventType, ExitType, Signal, Trade, TradeStatus};
use crate::error::{CortoError, Result};

const FILL_POLL: Duration = Duration::from_millis(200);
const CLOSE_FILL_POLL: Duration = Duration::from_secs(2);
const MARKET_FILL_WAIT: Duration = Duration::from_secs(10);

/// Which leg of a trade a venue order id belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderRole {
    Entry,
    Tp,
    Sl,
}

/// Venue orders are identified by `(pair, order_id)`; ids are only unique
/// per symbol.
type OrderKey = (String, i64);

/// Live trades and the order indexes used to route stream events
#[derive(Default)]
struct Registry {
    trades: HashMap<String, Arc<Mutex<Trade>>>,
    by_entry: HashMap<OrderKey, String>,
    by_tp: HashMap<OrderKey, String>,
    by_sl: HashMap<OrderKey, String>,
    by_client: HashMap<String, (String, OrderRole)>,
}

impl Registry {
    /// Match by `(pair, order_id)` first, then by client order id.
    fn resolve(&self, update: &OrderUpdate) -> Option<(String, OrderRole)> {
        let key = (update.symbol.clone(), update.order_id);
        if let Some(id) = self.by_entry.get(&key) {
            return Some((id.clone(), OrderRole::Entry));
        }
        if let Some(id) = self.by_tp.get(&key) {
            return Some((id.clone(), OrderRole::Tp));
        }
        if let Some(id) = self.by_sl.get(&key) {
            return Some((id.clone(), OrderRole::Sl));
        }
        self.by_client.get(&update.client_order_id).cloned()
    }

    fn unregister_order(&mut self, pair: &str, order_id: i64) {
        let key = (pair.to_string(), order_id);
        self.by_entry.remove(&key);
        self.by_tp.remove(&key);
        self.by_sl.remove(&key);
    }
}

/// Snapshot served by `GET /api/status`
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub active_trades: usize,
    pub open_trades: usize,
    pub max_open_trades: usize,
}

enum EntryWait {
    Filled,
    Failed,
    Timeout,
    Shutdown,
}

pub struct TradeEngine {
    cfg: Arc<AppConfig>,
    venue: Arc<BinanceClient>,
    store: Arc<SqliteStore>,
    events: EventSink,
    registry: Mutex<Registry>,
    shutdown: watch::Receiver<bool>,
}

impl TradeEngine {
    pub fn new(
        cfg: Arc<AppConfig>,
        venue: Arc<BinanceClient>,
        store: Arc<SqliteStore>,
        events: EventSink,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            venue,
            store,
            events,
            registry: Mutex::new(Registry::default()),
            shutdown,
        })
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    // ==================== Counters / snapshots ====================

    pub async fn active_count(&self) -> usize {
        let reg = self.registry.lock().await;
        let mut n = 0;
        for trade in reg.trades.values() {
            if !trade.lock().await.status.is_terminal() {
                n += 1;
            }
        }
        n
    }

    async fn active_count_pair(&self, pair: &str) -> usize {
        let reg = self.registry.lock().await;
        let mut n = 0;
        for trade in reg.trades.values() {
            let t = trade.lock().await;
            if t.pair == pair && !t.status.is_terminal() {
                n += 1;
            }
        }
        n
    }

    pub async fn status(&self) -> EngineStatus {
        let reg = self.registry.lock().await;
        let mut active = 0;
        let mut open = 0;
        for trade in reg.trades.values() {
            let t = trade.lock().await;
            if !t.status.is_terminal() {
                active += 1;
            }
            if t.status == TradeStatus::Open {
                open += 1;
            }
        }
        EngineStatus {
            active_trades: active,
            open_trades: open,
            max_open_trades: self.cfg.strategy.max_open_trades,
        }
    }

    async fn trade_arc(&self, trade_id: &str) -> Option<Arc<Mutex<Trade>>> {
        self.registry.lock().await.trades.get(trade_id).cloned()
    }

    async fn remove_trade(&self, trade_id: &str) {
        let mut reg = self.registry.lock().await;
        reg.trades.remove(trade_id);
        reg.by_entry.retain(|_, id| id.as_str() != trade_id);
        reg.by_tp.retain(|_, id| id.as_str() != trade_id);
        reg.by_sl.retain(|_, id| id.as_str() != trade_id);
        reg.by_client.retain(|_, (id, _)| id.as_str() != trade_id);
    }

    // ==================== Admission ====================

    /// Handle an incoming signal. Returns `Ok(true)` when a trade was
    /// created and its lifecycle task launched; `Ok(false)` when the signal
    /// was rejected by the admission limits.
    pub async fn on_signal(self: &Arc<Self>, signal: Signal) -> Result<bool> {
        if *self.shutdown.borrow() {
            return Ok(false);
        }

        let limits = &self.cfg.strategy;
        if self.active_count().await >= limits.max_open_trades {
            info!(
                pair = %signal.pair,
                max = limits.max_open_trades,
                "signal rejected: max_open_trades reached"
            );
            return Ok(false);
        }
        if self.active_count_pair(&signal.pair).await >= limits.max_trades_per_pair {
            info!(
                pair = %signal.pair,
                max = limits.max_trades_per_pair,
                "signal rejected: max_trades_per_pair reached"
            );
            return Ok(false);
        }

        let trade = Trade::from_signal(&signal);
        let trade_id = trade.trade_id.clone();
        self.store.save_trade(&trade).await?;
        self.events
            .emit(
                Some(trade_id.as_str()),
                EventType::Signal,
                json!({
                    "pair": signal.pair,
                    "rank": signal.rank,
                    "mom_1h_pct": signal.mom_1h_pct,
                    "close": signal.close,
                }),
            )
            .await;
        info!(trade_id = %trade.short_id(), pair = %trade.pair, "trade created from signal");

        let arc = Arc::new(Mutex::new(trade));
        self.registry
            .lock()
            .await
            .trades
            .insert(trade_id, arc.clone());

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.open_trade(arc, signal).await;
        });

        Ok(true)
    }

    /// Leverage and margin mode are configured lazily per pair; both calls
    /// are idempotent at the venue.
    async fn setup_pair(&self, pair: &str) {
        if let Err(e) = self.venue.set_margin_type(pair, "ISOLATED").await {
            warn!(pair, error = %e, "set_margin_type failed");
        }
        if let Err(e) = self
            .venue
            .set_leverage(pair, self.cfg.strategy.leverage)
            .await
        {
            warn!(pair, error = %e, "set_leverage failed");
        }
    }

    // ==================== Entry chase ====================

    async fn open_trade(self: Arc<Self>, trade: Arc<Mutex<Trade>>, signal: Signal) {
        let trade_id = {
            let mut t = trade.lock().await;
            if t.transition(TradeStatus::Opening).is_err() {
                return;
            }
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist OPENING failed");
            }
            t.trade_id.clone()
        };

        self.setup_pair(&signal.pair).await;

        if let Err(e) = self.chase_entry(&trade, &trade_id, &signal).await {
            error!(trade_id = %&trade_id[..8], error = %e, "entry failed");
            self.events
                .emit(
                    Some(trade_id.as_str()),
                    EventType::Error,
                    json!({"msg": e.to_string()}),
                )
                .await;
            self.mark_not_executed(&trade, "entry error").await;
        }
    }

    async fn chase_entry(
        &self,
        trade: &Arc<Mutex<Trade>>,
        trade_id: &str,
        signal: &Signal,
    ) -> Result<()> {
        let cfg = &self.cfg;
        let pair = signal.pair.as_str();
        let filters = self.venue.exchange_info(pair).await?;

        let best_bid = self.venue.best_bid(pair).await?;
        let qty = math::entry_quantity(
            cfg.strategy.capital_per_trade,
            cfg.strategy.leverage,
            best_bid,
            filters.step_size,
        );
        if qty < filters.min_qty || qty * best_bid < filters.min_notional {
            info!(
                trade_id = %&trade_id[..8],
                pair,
                %qty,
                %best_bid,
                min_notional = %filters.min_notional,
                "below minimum notional, not executing"
            );
            self.mark_not_executed(trade, "below min notional").await;
            return Ok(());
        }

        let short_id = &trade_id[..8.min(trade_id.len())];
        let chase_timeout = Duration::from_secs_f64(cfg.entry.chase_timeout_seconds);
        let chase_interval = Duration::from_secs_f64(cfg.entry.chase_interval_seconds);

        for attempt in 1..=cfg.entry.max_chase_attempts {
            if *self.shutdown.borrow() {
                self.mark_not_executed(trade, "shutdown during entry").await;
                return Ok(());
            }

            let client_id = format!("corto-{}-e{}", short_id, attempt);
            let placed = match cfg.entry.order_type {
                EntryOrderType::Bbo => {
                    // First attempt sits deeper in the book; the chase moves
                    // to the best bid for fill priority.
                    let price_match = if attempt == 1 { "OPPONENT_5" } else { "OPPONENT" };
                    self.venue
                        .open_short(pair, qty, None, Some(price_match), Some(&client_id))
                        .await
                        .map(|ack| (ack, price_match.to_string()))
                }
                EntryOrderType::LimitGtx => {
                    let bid = self.venue.best_bid(pair).await?;
                    let price = math::round_to_tick(bid, filters.tick_size);
                    self.venue
                        .open_short(pair, qty, Some(price), None, Some(&client_id))
                        .await
                        .map(|ack| (ack, format!("GTX@{}", price)))
                }
            };

            let (ack, mode) = match placed {
                Ok(v) => v,
                Err(e) => {
                    warn!(trade_id = short_id, attempt, error = %e, "entry attempt failed");
                    self.events
                        .emit(
                            Some(trade_id),
                            EventType::Error,
                            json!({"attempt": attempt, "error": e.to_string()}),
                        )
                        .await;
                    if attempt < cfg.entry.max_chase_attempts {
                        tokio::time::sleep(chase_interval).await;
                    }
                    continue;
                }
            };

            {
                let mut t = trade.lock().await;
                t.entry_order_id = Some(ack.order_id);
                t.entry_quantity = Some(qty);
                t.touch();
                self.store.save_trade(&t).await?;
            }
            {
                let mut reg = self.registry.lock().await;
                reg.by_entry
                    .insert((pair.to_string(), ack.order_id), trade_id.to_string());
                reg.by_client
                    .insert(client_id.clone(), (trade_id.to_string(), OrderRole::Entry));
            }
            self.events
                .emit(
                    Some(trade_id),
                    EventType::EntrySent,
                    json!({
                        "orderId": ack.order_id,
                        "mode": mode,
                        "qty": qty,
                        "attempt": attempt,
                    }),
                )
                .await;
            info!(
                trade_id = short_id,
                attempt,
                order_id = ack.order_id,
                mode = %mode,
                %qty,
                "entry order sent"
            );

            match self.wait_entry_fill(trade, chase_timeout).await {
                EntryWait::Filled => return Ok(()),
                EntryWait::Failed => return Ok(()),
                EntryWait::Timeout => {
                    info!(trade_id = short_id, attempt, "no fill within chase window");
                    if let Err(e) = self.venue.cancel_order(pair, ack.order_id).await {
                        warn!(order_id = ack.order_id, error = %e, "cancel entry failed");
                    }
                    self.registry.lock().await.unregister_order(pair, ack.order_id);
                    if attempt < cfg.entry.max_chase_attempts {
                        tokio::time::sleep(chase_interval).await;
                    }
                }
                EntryWait::Shutdown => {
                    info!(trade_id = short_id, "shutdown: cancelling pending entry");
                    if let Err(e) = self.venue.cancel_order(pair, ack.order_id).await {
                        warn!(order_id = ack.order_id, error = %e, "cancel entry failed");
                    }
                    self.registry.lock().await.unregister_order(pair, ack.order_id);
                    self.mark_not_executed(trade, "shutdown during entry").await;
                    return Ok(());
                }
            }
        }

        if cfg.entry.market_fallback {
            let client_id = format!("corto-{}-em", short_id);
            let ack = self
                .venue
                .open_short_market(pair, qty, Some(&client_id))
                .await?;
            {
                let mut t = trade.lock().await;
                t.entry_order_id = Some(ack.order_id);
                t.entry_quantity = Some(qty);
                t.touch();
                self.store.save_trade(&t).await?;
            }
            {
                let mut reg = self.registry.lock().await;
                reg.by_entry
                    .insert((pair.to_string(), ack.order_id), trade_id.to_string());
                reg.by_client
                    .insert(client_id, (trade_id.to_string(), OrderRole::Entry));
            }
            self.events
                .emit(
                    Some(trade_id),
                    EventType::EntrySent,
                    json!({"orderId": ack.order_id, "mode": "MARKET", "qty": qty}),
                )
                .await;

            if matches!(
                self.wait_entry_fill(trade, MARKET_FILL_WAIT).await,
                EntryWait::Filled
            ) {
                return Ok(());
            }
            warn!(trade_id = short_id, "market fallback did not fill");
            self.registry.lock().await.unregister_order(pair, ack.order_id);
        }

        warn!(trade_id = short_id, "entry chase exhausted, not executed");
        self.events
            .emit(
                Some(trade_id),
                EventType::Error,
                json!({"msg": "not executed: no fill after all attempts"}),
            )
            .await;
        self.mark_not_executed(trade, "no fill after all attempts").await;
        Ok(())
    }

    /// Wait for the dispatch loop to advance the trade, polling its status.
    async fn wait_entry_fill(&self, trade: &Arc<Mutex<Trade>>, timeout: Duration) -> EntryWait {
        let deadline = Instant::now() + timeout;
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return EntryWait::Shutdown;
            }
            {
                let t = trade.lock().await;
                match t.status {
                    TradeStatus::Open | TradeStatus::Closing | TradeStatus::Closed => {
                        return EntryWait::Filled
                    }
                    TradeStatus::NotExecuted | TradeStatus::Error => return EntryWait::Failed,
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return EntryWait::Timeout;
            }
            tokio::select! {
                _ = tokio::time::sleep(FILL_POLL) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn mark_not_executed(&self, trade: &Arc<Mutex<Trade>>, reason: &str) {
        let trade_id = {
            let mut t = trade.lock().await;
            if t.status.is_terminal() {
                return;
            }
            if t.status == TradeStatus::SignalReceived {
                let _ = t.transition(TradeStatus::Opening);
            }
            if t.transition(TradeStatus::NotExecuted).is_err() {
                return;
            }
            t.error_message = Some(reason.to_string());
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist NOT_EXECUTED failed");
            }
            self.events.push_trade(&t);
            info!(trade_id = %t.short_id(), reason, "trade not executed");
            t.trade_id.clone()
        };
        self.remove_trade(&trade_id).await;
    }

    // ==================== Dispatch ====================

    /// Consume order updates from the user-data stream until shutdown.
    pub async fn run_dispatch(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<OrderUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = updates.recv() => match maybe {
                    Some(update) => self.on_order_update(update).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    /// Route one order update to the owning trade. Unknown orders are
    /// logged and discarded.
    pub async fn on_order_update(self: &Arc<Self>, update: OrderUpdate) {
        let resolved = self.registry.lock().await.resolve(&update);
        let Some((trade_id, role)) = resolved else {
            debug!(
                order_id = update.order_id,
                symbol = %update.symbol,
                status = %update.status,
                "update for unknown order"
            );
            return;
        };

        if !update.is_filled() {
            debug!(
                trade_id = %&trade_id[..8],
                order_id = update.order_id,
                status = %update.status,
                "non-fill update"
            );
            return;
        }

        let Some(trade) = self.trade_arc(&trade_id).await else {
            return;
        };

        match role {
            OrderRole::Entry => self.on_entry_fill(&trade_id, &trade, &update).await,
            OrderRole::Tp => {
                self.on_exit_fill(&trade_id, &trade, &update, ExitType::Tp)
                    .await
            }
            OrderRole::Sl => {
                self.on_exit_fill(&trade_id, &trade, &update, ExitType::Sl)
                    .await
            }
        }
    }

    async fn on_entry_fill(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        update: &OrderUpdate,
    ) {
        {
            let mut reg = self.registry.lock().await;
            reg.by_entry
                .remove(&(update.symbol.clone(), update.order_id));
        }

        {
            let mut t = trade.lock().await;
            if t.status != TradeStatus::Opening {
                debug!(
                    trade_id = %t.short_id(),
                    status = %t.status,
                    "entry fill replay ignored"
                );
                return;
            }
            t.entry_price = Some(update.fill_price());
            t.entry_fill_ts = Some(Utc::now());
            if update.commission > Decimal::ZERO {
                t.entry_commission = Some(update.commission);
            }
            if t.transition(TradeStatus::Open).is_err() {
                return;
            }
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist OPEN failed");
            }
            info!(
                trade_id = %t.short_id(),
                price = %update.fill_price(),
                qty = ?t.entry_quantity,
                "entry filled, trade open"
            );
            self.events.push_trade(&t);
        }
        self.events
            .emit(
                Some(trade_id),
                EventType::EntryFill,
                json!({
                    "orderId": update.order_id,
                    "price": update.fill_price(),
                    "commission": update.commission,
                }),
            )
            .await;

        self.arm_exits(trade_id, trade).await;
    }

    // ==================== Exit arming ====================

    /// Place the venue-resident TP and SL for an open trade. TP goes first:
    /// any partial failure therefore leaves TP-only, never SL-without-TP.
    pub(crate) async fn arm_exits(self: &Arc<Self>, trade_id: &str, trade: &Arc<Mutex<Trade>>) {
        let (pair, qty, entry_price) = {
            let t = trade.lock().await;
            match (t.entry_quantity, t.entry_price) {
                (Some(q), Some(p)) => (t.pair.clone(), q, p),
                _ => {
                    error!(trade_id = %t.short_id(), "cannot arm exits without entry data");
                    return;
                }
            }
        };

        if self.arm_tp(trade_id, trade, &pair, qty, entry_price).await {
            self.arm_sl(trade_id, trade, &pair, qty, entry_price).await;
        }
    }

    async fn arm_tp(
        &self,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) -> bool {
        let filters = match self.venue.exchange_info(pair).await {
            Ok(f) => f,
            Err(e) => {
                self.fail_trade(trade, &format!("exchange info: {}", e)).await;
                return false;
            }
        };
        let trigger = math::tp_trigger(entry_price, self.cfg.strategy.tp_pct, filters.tick_size);

        match self.venue.place_tp(pair, qty, trigger).await {
            Ok(ack) => {
                {
                    let mut t = trade.lock().await;
                    t.tp_order_id = Some(ack.order_id);
                    t.tp_trigger_price = Some(ack.trigger_price.unwrap_or(trigger));
                    t.touch();
                    if let Err(e) = self.store.save_trade(&t).await {
                        error!(trade_id = %t.short_id(), error = %e, "persist TP failed");
                    }
                }
                self.registry
                    .lock()
                    .await
                    .by_tp
                    .insert((pair.to_string(), ack.order_id), trade_id.to_string());
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::TpPlaced,
                        json!({"orderId": ack.order_id, "triggerPrice": trigger}),
                    )
                    .await;
                info!(
                    trade_id = %&trade_id[..8],
                    order_id = ack.order_id,
                    %trigger,
                    "TP resident at venue"
                );
                true
            }
            Err(e) => {
                error!(trade_id = %&trade_id[..8], error = %e, "TP placement failed");
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::Error,
                        json!({"msg": format!("TP error: {}", e)}),
                    )
                    .await;
                self.fail_trade(trade, &format!("TP placement failed: {}", e))
                    .await;
                false
            }
        }
    }

    async fn arm_sl(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        pair: &str,
        qty: Decimal,
        entry_price: Decimal,
    ) {
        let filters = match self.venue.exchange_info(pair).await {
            Ok(f) => f,
            Err(e) => {
                self.cancel_exit_leg(trade, ExitType::Tp).await;
                self.fail_trade(trade, &format!("exchange info: {}", e)).await;
                return;
            }
        };
        let trigger = math::sl_trigger(entry_price, self.cfg.strategy.sl_pct, filters.tick_size);

        match self.venue.place_sl(pair, qty, trigger).await {
            Ok(ack) => {
                {
                    let mut t = trade.lock().await;
                    t.sl_order_id = Some(ack.order_id);
                    t.sl_trigger_price = Some(ack.trigger_price.unwrap_or(trigger));
                    t.touch();
                    if let Err(e) = self.store.save_trade(&t).await {
                        error!(trade_id = %t.short_id(), error = %e, "persist SL failed");
                    }
                }
                self.registry
                    .lock()
                    .await
                    .by_sl
                    .insert((pair.to_string(), ack.order_id), trade_id.to_string());
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::SlPlaced,
                        json!({"orderId": ack.order_id, "triggerPrice": trigger}),
                    )
                    .await;
                info!(
                    trade_id = %&trade_id[..8],
                    order_id = ack.order_id,
                    %trigger,
                    "SL resident at venue"
                );
            }
            Err(e) if e.venue_code() == Some(CODE_WOULD_TRIGGER) => {
                // Mark price is already past the stop: the position must be
                // closed now, at market.
                warn!(
                    trade_id = %&trade_id[..8],
                    pair,
                    "SL trigger already crossed, closing at market"
                );
                self.close_crossed_sl(trade_id, trade, pair, qty).await;
            }
            Err(e) => {
                error!(trade_id = %&trade_id[..8], error = %e, "SL placement failed");
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::Error,
                        json!({"msg": format!("SL error: {}", e)}),
                    )
                    .await;
                self.cancel_exit_leg(trade, ExitType::Tp).await;
                self.fail_trade(trade, &format!("SL placement failed: {}", e))
                    .await;
            }
        }
    }

    /// SL rejected with -2021: the stop level was crossed before the order
    /// reached the book. Close immediately and resolve as an SL exit.
    async fn close_crossed_sl(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        pair: &str,
        qty: Decimal,
    ) {
        match self.market_close_fill(pair, qty).await {
            Ok(exit_price) => {
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
                    t.exit_type = Some(ExitType::Sl);
                    if let Err(e) = self.store.save_trade(&t).await {
                        error!(trade_id = %t.short_id(), error = %e, "persist CLOSING failed");
                    }
                }
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::SlFill,
                        json!({"price": exit_price, "immediate": true}),
                    )
                    .await;
                self.cancel_exit_leg(trade, ExitType::Tp).await;
                self.finalize_close(trade).await;
            }
            Err(e) => {
                error!(trade_id = %&trade_id[..8], error = %e, "market close after -2021 failed");
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::Error,
                        json!({"msg": format!("SL -2021 close error: {}", e)}),
                    )
                    .await;
                self.fail_trade(trade, &format!("SL close failed: {}", e)).await;
            }
        }
    }

    // ==================== Exit resolution ====================

    async fn on_exit_fill(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        update: &OrderUpdate,
        exit_type: ExitType,
    ) {
        self.registry
            .lock()
            .await
            .unregister_order(&update.symbol, update.order_id);

        let event_type = match exit_type {
            ExitType::Tp => EventType::TpFill,
            _ => EventType::SlFill,
        };

        {
            let mut t = trade.lock().await;
            if t.status != TradeStatus::Open {
                // A competing exit already won; keep the fill for audit.
                drop(t);
                self.events
                    .emit(
                        Some(trade_id),
                        event_type,
                        json!({
                            "orderId": update.order_id,
                            "price": update.fill_price(),
                            "ignored": true,
                        }),
                    )
                    .await;
                return;
            }
            if t.transition(TradeStatus::Closing).is_err() {
                return;
            }
            t.exit_price = Some(update.fill_price());
            t.exit_fill_ts = Some(Utc::now());
            t.exit_type = Some(exit_type);
            if update.commission > Decimal::ZERO {
                t.exit_commission = Some(update.commission);
            }
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist CLOSING failed");
            }
            match exit_type {
                ExitType::Tp => info!(
                    trade_id = %t.short_id(),
                    price = %update.fill_price(),
                    "take-profit filled"
                ),
                _ => warn!(
                    trade_id = %t.short_id(),
                    price = %update.fill_price(),
                    "stop-loss filled"
                ),
            }
        }
        self.events
            .emit(
                Some(trade_id),
                event_type,
                json!({"orderId": update.order_id, "price": update.fill_price()}),
            )
            .await;

        let counterpart = match exit_type {
            ExitType::Tp => ExitType::Sl,
            _ => ExitType::Tp,
        };
        self.cancel_exit_leg(trade, counterpart).await;
        self.finalize_close(trade).await;
    }

    /// Cancel the TP or SL order of a trade at the venue (idempotent) and
    /// drop it from the routing indexes.
    pub(crate) async fn cancel_exit_leg(&self, trade: &Arc<Mutex<Trade>>, leg: ExitType) {
        let (pair, order_id) = {
            let t = trade.lock().await;
            let id = match leg {
                ExitType::Tp => t.tp_order_id,
                _ => t.sl_order_id,
            };
            match id {
                Some(id) => (t.pair.clone(), id),
                None => return,
            }
        };

        if let Err(e) = self.venue.cancel_order(&pair, order_id).await {
            warn!(pair = %pair, order_id, leg = %leg, error = %e, "cancel exit leg failed");
        }
        self.registry.lock().await.unregister_order(&pair, order_id);
    }

    /// Compute PnL and move `CLOSING → CLOSED`.
    pub(crate) async fn finalize_close(&self, trade: &Arc<Mutex<Trade>>) {
        let trade_id = {
            let mut t = trade.lock().await;
            if let (Some(entry), Some(exit), Some(qty)) =
                (t.entry_price, t.exit_price, t.entry_quantity)
            {
                if exit > Decimal::ZERO {
                    let pnl = math::compute_pnl(
                        entry,
                        exit,
                        qty,
                        self.cfg.strategy.capital_per_trade,
                        t.entry_commission,
                        t.exit_commission,
                    );
                    t.pnl_usdt = Some(pnl.pnl_usdt);
                    t.pnl_pct = Some(pnl.pnl_pct);
                    t.fees_usdt = Some(pnl.fees_usdt);
                }
            }
            if t.transition(TradeStatus::Closed).is_err() {
                return;
            }
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist CLOSED failed");
            }
            info!(
                trade_id = %t.short_id(),
                pair = %t.pair,
                exit_type = ?t.exit_type,
                pnl_usdt = ?t.pnl_usdt,
                pnl_pct = ?t.pnl_pct,
                "trade closed"
            );
            self.events.push_trade(&t);
            t.trade_id.clone()
        };
        self.remove_trade(&trade_id).await;
    }

    /// Move a trade to ERROR; it will not be re-driven by the engine.
    pub(crate) async fn fail_trade(&self, trade: &Arc<Mutex<Trade>>, message: &str) {
        let trade_id = {
            let mut t = trade.lock().await;
            if t.status.is_terminal() {
                return;
            }
            if t.transition(TradeStatus::Error).is_err() {
                return;
            }
            t.error_message = Some(message.to_string());
            if let Err(e) = self.store.save_trade(&t).await {
                error!(trade_id = %t.short_id(), error = %e, "persist ERROR failed");
            }
            error!(trade_id = %t.short_id(), message, "trade moved to ERROR");
            self.events.push_trade(&t);
            t.trade_id.clone()
        };
        self.remove_trade(&trade_id).await;
    }

    // ==================== Timeout / manual close ====================

    /// Periodic scan closing trades whose holding time has elapsed.
    pub async fn run_timeout_scanner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let timeout = chrono::Duration::seconds(
                (self.cfg.strategy.timeout_hours * 3600.0) as i64,
            );
            let now = Utc::now();

            let candidates: Vec<(String, Arc<Mutex<Trade>>)> = {
                let reg = self.registry.lock().await;
                reg.trades
                    .iter()
                    .map(|(id, arc)| (id.clone(), arc.clone()))
                    .collect()
            };

            for (trade_id, trade) in candidates {
                let due = {
                    let t = trade.lock().await;
                    t.status == TradeStatus::Open
                        && t.entry_fill_ts
                            .map(|ts| now - ts >= timeout)
                            .unwrap_or(false)
                };
                if !due {
                    continue;
                }

                info!(trade_id = %&trade_id[..8], "holding time elapsed, forcing exit");
                self.events
                    .emit(
                        Some(trade_id.as_str()),
                        EventType::Timeout,
                        json!({"timeout_hours": self.cfg.strategy.timeout_hours}),
                    )
                    .await;

                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = engine.force_close(&trade_id, &trade, ExitType::Timeout).await {
                        match e {
                            CortoError::InvalidStateTransition { .. } => {}
                            e => error!(trade_id = %&trade_id[..8], error = %e, "timeout close failed"),
                        }
                    }
                });
            }
        }
        debug!("timeout scanner stopped");
    }

    /// Manual close requested through the control API. Fails unless the
    /// trade is OPEN; returns the updated snapshot.
    pub async fn close_manual(self: &Arc<Self>, trade_id: &str) -> Result<Trade> {
        let Some(trade) = self.trade_arc(trade_id).await else {
            return match self.store.get_trade(trade_id).await? {
                Some(t) => Err(CortoError::InvalidStateTransition {
                    from: t.status.to_string(),
                    to: TradeStatus::Closing.to_string(),
                }),
                None => Err(CortoError::TradeNotFound(trade_id.to_string())),
            };
        };

        self.events
            .emit(
                Some(trade_id),
                EventType::Cancel,
                json!({"reason": "manual close requested"}),
            )
            .await;
        self.force_close(trade_id, &trade, ExitType::Manual).await
    }

    /// Shared timeout/manual close path: cancel both resident exits, then
    /// leave per the configured close order type.
    async fn force_close(
        self: &Arc<Self>,
        trade_id: &str,
        trade: &Arc<Mutex<Trade>>,
        exit_type: ExitType,
    ) -> Result<Trade> {
        let (pair, qty) = {
            let mut t = trade.lock().await;
            if t.status != TradeStatus::Open {
                return Err(CortoError::InvalidStateTransition {
                    from: t.status.to_string(),
                    to: TradeStatus::Closing.to_string(),
                });
            }
            t.transition(TradeStatus::Closing)?;
            t.exit_type = Some(exit_type);
            self.store.save_trade(&t).await?;
            let qty = t.entry_quantity.ok_or_else(|| {
                CortoError::Internal(format!("trade {} has no quantity", t.short_id()))
            })?;
            (t.pair.clone(), qty)
        };

        self.cancel_exit_leg(trade, ExitType::Tp).await;
        self.cancel_exit_leg(trade, ExitType::Sl).await;

        let cfg = &self.cfg.exit;
        let chase = Duration::from_secs_f64(cfg.timeout_chase_seconds);

        if cfg.timeout_order_type != TimeoutOrderType::Market {
            let ack = match cfg.timeout_order_type {
                TimeoutOrderType::Bbo => self.venue.close_position_bbo(&pair, qty).await,
                _ => {
                    let ask = self.venue.best_ask(&pair).await?;
                    let filters = self.venue.exchange_info(&pair).await?;
                    let price = math::round_to_tick(ask, filters.tick_size);
                    self.venue.close_position_limit(&pair, qty, price).await
                }
            };

            match ack {
                Ok(ack) => {
                    info!(
                        trade_id = %&trade_id[..8],
                        order_id = ack.order_id,
                        "close order sent, waiting for fill"
                    );
                    if let Some(price) = self.wait_close_fill(&pair, ack.order_id, chase).await {
                        return self.record_forced_exit(trade, price).await;
                    }
                    if let Err(e) = self.venue.cancel_order(&pair, ack.order_id).await {
                        warn!(order_id = ack.order_id, error = %e, "cancel close order failed");
                    }
                }
                Err(e) => {
                    warn!(trade_id = %&trade_id[..8], error = %e, "close order failed");
                }
            }

            if !cfg.timeout_market_fallback {
                self.fail_trade(trade, "forced close did not fill and market fallback is off")
                    .await;
                return Err(CortoError::Internal(
                    "forced close did not fill".to_string(),
                ));
            }
        }

        match self.market_close_fill(&pair, qty).await {
            Ok(price) => self.record_forced_exit(trade, price).await,
            Err(e) => {
                self.events
                    .emit(
                        Some(trade_id),
                        EventType::Error,
                        json!({"msg": format!("forced close failed: {}", e)}),
                    )
                    .await;
                self.fail_trade(trade, &format!("forced close failed: {}", e))
                    .await;
                Err(e)
            }
        }
    }

    async fn record_forced_exit(
        &self,
        trade: &Arc<Mutex<Trade>>,
        exit_price: Decimal,
    ) -> Result<Trade> {
        {
            let mut t = trade.lock().await;
            t.exit_price = Some(exit_price);
            t.exit_fill_ts = Some(Utc::now());
            t.touch();
            self.store.save_trade(&t).await?;
        }
        self.finalize_close(trade).await;
        let t = trade.lock().await.clone();
        Ok(t)
    }

    /// Market close returning the realized fill price.
    async fn market_close_fill(&self, pair: &str, qty: Decimal) -> Result<Decimal> {
        let ack = self.venue.close_position_market(pair, qty).await?;
        if let Some(price) = ack.avg_price {
            return Ok(price);
        }
        self.wait_close_fill(pair, ack.order_id, MARKET_FILL_WAIT)
            .await
            .ok_or_else(|| {
                CortoError::Internal(format!("market close {} reported no fill", ack.order_id))
            })
    }

    /// Poll the venue until the close order fills or the window elapses.
    async fn wait_close_fill(
        &self,
        pair: &str,
        order_id: i64,
        timeout: Duration,
    ) -> Option<Decimal> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(CLOSE_FILL_POLL).await;
            match self.venue.query_order(pair, order_id).await {
                Ok(state) if state.is_filled() => {
                    return Some(state.avg_price);
                }
                Ok(_) => {}
                Err(e) => debug!(order_id, error = %e, "close fill poll failed"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BinanceConfig, DashboardConfig, DatabaseConfig, EntryConfig, ExitConfig,
        LoggingConfig, SignalsConfig, StrategyConfig,
    };
    use rust_decimal_macros::dec;

    fn test_cfg(max_open: usize, max_per_pair: usize) -> AppConfig {
        AppConfig {
            binance: BinanceConfig {
                api_key: "k".into(),
                api_secret: "s".into(),
                // Closed port: every venue call fails fast and is tolerated
                base_url: "http://127.0.0.1:9".into(),
                recv_window: 5000,
            },
            strategy: StrategyConfig {
                capital_per_trade: dec!(10),
                leverage: 1,
                tp_pct: dec!(15),
                sl_pct: dec!(60),
                timeout_hours: 24.0,
                max_open_trades: max_open,
                max_trades_per_pair: max_per_pair,
                top_n: 1,
                min_momentum_pct: 0.0,
                min_vol_ratio: 0.0,
                min_trades_ratio: 0.0,
                allowed_quintiles: vec![1, 2, 3, 4, 5],
                trigger_offset_pct: 10.0,
            },
            signals: SignalsConfig::default(),
            entry: EntryConfig::default(),
            exit: ExitConfig::default(),
            dashboard: DashboardConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig { path: ":memory:".into() },
        }
    }

    /// The sender must stay alive for the engine's lifetime: a dropped
    /// shutdown channel reads as an immediate `changed()` in the wait loops.
    async fn test_engine(
        max_open: usize,
        max_per_pair: usize,
    ) -> (Arc<TradeEngine>, watch::Sender<bool>) {
        let cfg = Arc::new(test_cfg(max_open, max_per_pair));
        let store = Arc::new(crate::adapters::SqliteStore::new_in_memory().await.unwrap());
        store.migrate().await.unwrap();
        let venue = Arc::new(BinanceClient::new(&cfg.binance).unwrap());
        let events = EventSink::new(store.clone());
        let (tx, rx) = watch::channel(false);
        (TradeEngine::new(cfg, venue, store, events, rx), tx)
    }

    fn signal(pair: &str) -> Signal {
        Signal {
            fecha_hora: "2025/06/01 12:00:00".into(),
            pair: pair.into(),
            rank: 1,
            close: dec!(0.5),
            mom_1h_pct: 12.5,
            mom_pct: 8.0,
            vol_ratio: 3.0,
            trades_ratio: 2.0,
            quintil: 2,
            signal_dt: Utc::now(),
        }
    }

    /// Seed an OPEN trade with resident TP/SL ids, as if the entry had
    /// filled and both exits were armed.
    async fn insert_open_trade(
        engine: &Arc<TradeEngine>,
        pair: &str,
        tp_id: i64,
        sl_id: i64,
    ) -> String {
        let mut t = Trade::from_signal(&signal(pair));
        t.status = TradeStatus::Open;
        t.entry_order_id = Some(1);
        t.entry_price = Some(dec!(100.00));
        t.entry_quantity = Some(dec!(0.1));
        t.entry_fill_ts = Some(Utc::now());
        t.tp_order_id = Some(tp_id);
        t.sl_order_id = Some(sl_id);
        t.tp_trigger_price = Some(dec!(85.00));
        t.sl_trigger_price = Some(dec!(160.00));
        engine.store.save_trade(&t).await.unwrap();

        let trade_id = t.trade_id.clone();
        let mut reg = engine.registry.lock().await;
        reg.by_tp.insert((pair.to_string(), tp_id), trade_id.clone());
        reg.by_sl.insert((pair.to_string(), sl_id), trade_id.clone());
        reg.trades.insert(trade_id.clone(), Arc::new(Mutex::new(t)));
        trade_id
    }

    fn fill(symbol: &str, order_id: i64, price: Decimal) -> OrderUpdate {
        OrderUpdate {
            symbol: symbol.into(),
            order_id,
            client_order_id: String::new(),
            side: "BUY".into(),
            status: "FILLED".into(),
            avg_price: price,
            last_price: price,
            last_qty: dec!(0.1),
            cum_qty: dec!(0.1),
            commission: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn test_admission_rejects_over_max_open() {
        let (engine, _shutdown_tx) = test_engine(1, 1).await;
        assert!(engine.on_signal(signal("AAAUSDT")).await.unwrap());
        // Second signal hits the global cap while the first is still live
        assert!(!engine.on_signal(signal("BBBUSDT")).await.unwrap());

        // No trade row was created for the rejected signal
        let trades = engine.store.list_trades(10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pair, "AAAUSDT");
    }

    #[tokio::test]
    async fn test_admission_rejects_over_pair_limit() {
        let (engine, _shutdown_tx) = test_engine(10, 1).await;
        assert!(engine.on_signal(signal("AAAUSDT")).await.unwrap());
        assert!(!engine.on_signal(signal("AAAUSDT")).await.unwrap());
        // A different pair is still admitted
        assert!(engine.on_signal(signal("BBBUSDT")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_order_update_is_discarded() {
        let (engine, _shutdown_tx) = test_engine(1, 1).await;
        let before = engine.store.recent_events(100).await.unwrap().len();
        engine.on_order_update(fill("AAAUSDT", 999, dec!(1))).await;
        let after = engine.store.recent_events(100).await.unwrap().len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_tp_fill_resolves_exit_once() {
        let (engine, _shutdown_tx) = test_engine(5, 5).await;
        let trade_id = insert_open_trade(&engine, "AAAUSDT", 10, 11).await;

        // TP fills at the trigger (cancel of the SL fails against the dead
        // venue and is tolerated)
        engine.on_order_update(fill("AAAUSDT", 10, dec!(85.00))).await;

        let closed = engine.store.get_trade(&trade_id).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_type, Some(ExitType::Tp));
        assert_eq!(closed.exit_price, Some(dec!(85.00)));
        assert_eq!(closed.pnl_usdt, Some(dec!(1.4926)));
        assert_eq!(closed.fees_usdt, Some(dec!(0.0074)));

        // The trade left the registry
        assert!(engine.trade_arc(&trade_id).await.is_none());

        // Replaying the same fill changes nothing and appends nothing
        let events_before = engine.store.recent_events(100).await.unwrap().len();
        engine.on_order_update(fill("AAAUSDT", 10, dec!(85.00))).await;
        let events_after = engine.store.recent_events(100).await.unwrap().len();
        assert_eq!(events_before, events_after);

        let still = engine.store.get_trade(&trade_id).await.unwrap().unwrap();
        assert_eq!(still.status, TradeStatus::Closed);
        assert_eq!(still.exit_type, Some(ExitType::Tp));
    }

    #[tokio::test]
    async fn test_losing_exit_event_does_not_flip_result() {
        let (engine, _shutdown_tx) = test_engine(5, 5).await;
        let trade_id = insert_open_trade(&engine, "AAAUSDT", 20, 21).await;

        // TP wins; a late SL fill (venue-side race: SL filled before our
        // cancel landed) must not flip the resolved exit.
        engine.on_order_update(fill("AAAUSDT", 20, dec!(85.00))).await;
        engine.on_order_update(fill("AAAUSDT", 21, dec!(160.00))).await;

        let closed = engine.store.get_trade(&trade_id).await.unwrap().unwrap();
        assert_eq!(closed.exit_type, Some(ExitType::Tp));
        assert_eq!(closed.exit_price, Some(dec!(85.00)));
    }

    #[tokio::test]
    async fn test_manual_close_unknown_trade() {
        let (engine, _shutdown_tx) = test_engine(1, 1).await;
        let err = engine.close_manual("nope").await.unwrap_err();
        assert!(matches!(err, CortoError::TradeNotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_close_requires_open() {
        let (engine, _shutdown_tx) = test_engine(5, 5).await;
        let mut t = Trade::from_signal(&signal("AAAUSDT"));
        t.status = TradeStatus::Closed;
        engine.store.save_trade(&t).await.unwrap();

        let err = engine.close_manual(&t.trade_id).await.unwrap_err();
        assert!(matches!(err, CortoError::InvalidStateTransition { .. }));
    }
}
