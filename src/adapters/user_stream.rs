//! Binance user-data stream adapter.
//!
//! Long-lived authenticated WebSocket subscription delivering order updates
//! to the engine. Holds a listen key (renewed every 25 minutes, well under
//! the venue's 60-minute expiry), reconnects with capped exponential backoff,
//! and publishes its connection state so the engine can reconcile after a
//! gap.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::adapters::BinanceClient;
use crate::error::Result;

const KEEPALIVE_SECS: u64 = 60 * 25;
const MAX_RECONNECT_DELAY_SECS: u64 = 30;

/// A normalized order update from `ORDER_TRADE_UPDATE`
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: i64,
    pub client_order_id: String,
    pub side: String,
    /// NEW, PARTIALLY_FILLED, FILLED, CANCELED, EXPIRED, REJECTED
    pub status: String,
    pub avg_price: Decimal,
    pub last_price: Decimal,
    pub last_qty: Decimal,
    pub cum_qty: Decimal,
    pub commission: Decimal,
}

impl OrderUpdate {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    /// Best fill-price estimate the venue reported.
    pub fn fill_price(&self) -> Decimal {
        if self.avg_price > Decimal::ZERO {
            self.avg_price
        } else {
            self.last_price
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "e", default)]
    event_type: Option<String>,
    #[serde(rename = "o", default)]
    order: Option<RawOrderUpdate>,
}

#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i", default)]
    order_id: i64,
    #[serde(rename = "c", default)]
    client_order_id: String,
    #[serde(rename = "S", default)]
    side: String,
    #[serde(rename = "X", default)]
    status: String,
    #[serde(rename = "x", default)]
    exec_type: String,
    #[serde(rename = "ap", default)]
    avg_price: String,
    #[serde(rename = "L", default)]
    last_price: String,
    #[serde(rename = "l", default)]
    last_qty: String,
    #[serde(rename = "z", default)]
    cum_qty: String,
    #[serde(rename = "n", default)]
    commission: String,
}

impl RawOrderUpdate {
    fn normalize(self) -> OrderUpdate {
        OrderUpdate {
            symbol: self.symbol,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            side: self.side,
            status: self.status,
            avg_price: parse_dec(&self.avg_price),
            last_price: parse_dec(&self.last_price),
            last_qty: parse_dec(&self.last_qty),
            cum_qty: parse_dec(&self.cum_qty),
            commission: parse_dec(&self.commission),
        }
    }
}

fn parse_dec(s: &str) -> Decimal {
    s.parse::<Decimal>().unwrap_or(Decimal::ZERO)
}

/// User-data stream client
pub struct UserDataStream {
    client: Arc<BinanceClient>,
    ws_base: String,
    updates_tx: mpsc::Sender<OrderUpdate>,
    connected_tx: watch::Sender<bool>,
}

impl UserDataStream {
    pub fn new(
        client: Arc<BinanceClient>,
        ws_base: &str,
        updates_tx: mpsc::Sender<OrderUpdate>,
    ) -> (Self, watch::Receiver<bool>) {
        let (connected_tx, connected_rx) = watch::channel(false);
        (
            Self {
                client,
                ws_base: ws_base.trim_end_matches('/').to_string(),
                updates_tx,
                connected_tx,
            },
            connected_rx,
        )
    }

    /// Run the stream with automatic reconnection until `shutdown` fires.
    /// Each successful reconnect uses a fresh listen key.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_and_stream(&mut shutdown).await {
                Ok(()) => {
                    // Clean exit only happens on shutdown
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    let _ = self.connected_tx.send(false);
                    let delay = reconnect_delay(attempt);
                    warn!(error = %e, attempt, ?delay, "user stream disconnected, reconnecting");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        let _ = self.connected_tx.send(false);
        info!("user data stream stopped");
    }

    async fn connect_and_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let listen_key = self.client.listen_key().await?;
        let url = format!("{}/ws/{}", self.ws_base, listen_key);
        info!(host = %self.ws_base, "connecting user data stream");

        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws.split();
        let _ = self.connected_tx.send(true);
        info!("user data stream connected");

        let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
        keepalive.tick().await; // first tick is immediate

        let result = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_message(&text).await.is_break() {
                                // Expired listen key: surface as an error so
                                // the outer loop reconnects with a fresh key.
                                break Err(crate::error::CortoError::Internal(
                                    "listen key expired".into(),
                                ));
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            break Err(crate::error::CortoError::Internal(
                                "server closed the stream".into(),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(e.into()),
                        None => {
                            break Err(crate::error::CortoError::Internal(
                                "user stream ended".into(),
                            ));
                        }
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.client.keepalive_listen_key(&listen_key).await {
                        warn!(error = %e, "listen key keepalive failed");
                    }
                }
                _ = shutdown.changed() => {
                    let _ = self.client.close_listen_key(&listen_key).await;
                    break Ok(());
                }
            }
        };

        if result.is_err() {
            let _ = self.connected_tx.send(false);
        }
        result
    }

    /// Returns `Break` when the venue announced the listen key expired and a
    /// reconnect is required.
    async fn handle_message(&self, text: &str) -> std::ops::ControlFlow<()> {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(_) => {
                debug!(raw = &text[..text.len().min(200)], "unparseable stream message");
                return std::ops::ControlFlow::Continue(());
            }
        };

        match envelope.event_type.as_deref() {
            Some("ORDER_TRADE_UPDATE") => {
                if let Some(raw) = envelope.order {
                    // Only terminal order states matter to the engine; partial
                    // fills resolve into the final FILLED update.
                    if matches!(raw.status.as_str(), "FILLED" | "CANCELED" | "EXPIRED" | "REJECTED")
                        && raw.exec_type != "NEW"
                    {
                        let update = raw.normalize();
                        debug!(
                            order_id = update.order_id,
                            symbol = %update.symbol,
                            status = %update.status,
                            "order update"
                        );
                        if self.updates_tx.send(update).await.is_err() {
                            error!("order update channel closed");
                        }
                    }
                }
            }
            Some("listenKeyExpired") => {
                warn!("listen key expired, forcing reconnect");
                return std::ops::ControlFlow::Break(());
            }
            Some(other) => {
                debug!(event = other, "ignoring stream event");
            }
            None => {}
        }
        std::ops::ControlFlow::Continue(())
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(5).saturating_sub(1);
    Duration::from_secs(secs.min(MAX_RECONNECT_DELAY_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_update_parse() {
        let raw = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000000,
            "o": {
                "s": "AAAUSDT", "i": 42, "c": "corto-abc", "S": "SELL",
                "X": "FILLED", "x": "TRADE",
                "ap": "100.00", "L": "100.00", "l": "0.1", "z": "0.1",
                "n": "0.004"
            }
        }"#;
        let env: WsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.event_type.as_deref(), Some("ORDER_TRADE_UPDATE"));
        let update = env.order.unwrap().normalize();
        assert_eq!(update.order_id, 42);
        assert_eq!(update.symbol, "AAAUSDT");
        assert!(update.is_filled());
        assert_eq!(update.fill_price(), dec!(100.00));
        assert_eq!(update.commission, dec!(0.004));
    }

    #[test]
    fn test_fill_price_falls_back_to_last() {
        let update = OrderUpdate {
            symbol: "AAAUSDT".into(),
            order_id: 1,
            client_order_id: String::new(),
            side: "BUY".into(),
            status: "FILLED".into(),
            avg_price: Decimal::ZERO,
            last_price: dec!(85.0),
            last_qty: dec!(0.1),
            cum_qty: dec!(0.1),
            commission: Decimal::ZERO,
        };
        assert_eq!(update.fill_price(), dec!(85.0));
    }

    #[test]
    fn test_reconnect_delay_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert!(reconnect_delay(10) <= Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
    }
}
