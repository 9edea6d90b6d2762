//! Binance USDⓈ-M futures REST adapter.
//!
//! Signed request/response surface with retry on transient failures. Entry
//! orders go through `/fapi/v1/order`; the venue-resident TP and SL are
//! CONDITIONAL algo orders through `/fapi/v1/algoOrder`, so they keep
//! protecting the position across process restarts.
//!
//! Signatures are HMAC-SHA256 over the urlencoded query string. Binance
//! rejects requests whose `timestamp` drifts outside the recv window, so the
//! client measures the server clock offset at startup and signs with
//! server-referenced time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BinanceConfig;
use crate::error::{CortoError, Result};

type HmacSha256 = Hmac<Sha256>;

const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1500;
const RETRY_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Binance error codes the client treats as benign
pub const CODE_UNKNOWN_ORDER: i64 = -2011;
pub const CODE_MARGIN_NO_CHANGE: i64 = -4046;
/// "Order would immediately trigger" — returned when the trigger price of a
/// conditional order has already been crossed.
pub const CODE_WOULD_TRIGGER: i64 = -2021;

/// Per-symbol exchange filters used for rounding and sizing
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

/// Acknowledgement of a placed order (regular or algo)
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub status: String,
    pub trigger_price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
}

/// Current state of an order as reported by `GET /fapi/v1/order`
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: i64,
    pub status: String,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
}

impl OrderState {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }
}

/// An open position as reported by `GET /fapi/v2/positionRisk`
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
}

/// Binance futures REST client
pub struct BinanceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window: u64,
    /// server_time − local_time, in milliseconds
    time_offset_ms: AtomicI64,
    filters: RwLock<HashMap<String, SymbolFilters>>,
}

impl BinanceClient {
    pub fn new(cfg: &BinanceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            api_secret: cfg.api_secret.clone(),
            recv_window: cfg.recv_window,
            time_offset_ms: AtomicI64::new(0),
            filters: RwLock::new(HashMap::new()),
        })
    }

    // ==================== Time & signing ====================

    /// Measure the venue clock offset; signed requests use server time.
    pub async fn sync_server_time(&self) -> Result<()> {
        let body = self
            .request(Method::GET, "/fapi/v1/time", Vec::new(), false)
            .await?;
        let server_ms = body
            .get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| CortoError::Internal("no serverTime in response".into()))?;
        let local_ms = local_time_ms();
        let offset = server_ms - local_ms;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "Binance server time synced");
        Ok(())
    }

    fn timestamp_ms(&self) -> i64 {
        local_time_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // ==================== HTTP core ====================

    async fn request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        signed: bool,
    ) -> Result<Value> {
        if signed {
            params.push(("recvWindow", self.recv_window.to_string()));
            params.push(("timestamp", self.timestamp_ms().to_string()));
        }
        let mut query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        if signed {
            let signature = self.sign(&query);
            query.push_str("&signature=");
            query.push_str(&signature);
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut last_error = String::new();
        for attempt in 1..=MAX_RETRIES {
            let response = self
                .http
                .request(method.clone(), &url)
                .header("X-MBX-APIKEY", &self.api_key)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    debug!(%method, path, status = status.as_u16(), "binance request");

                    if status.is_success() {
                        return Ok(body);
                    }
                    if RETRY_STATUS.contains(&status.as_u16()) {
                        last_error = format!("HTTP {}", status.as_u16());
                        warn!(
                            path,
                            attempt,
                            status = status.as_u16(),
                            "transient Binance error, backing off"
                        );
                    } else {
                        let code = body
                            .get("code")
                            .and_then(Value::as_i64)
                            .unwrap_or(status.as_u16() as i64);
                        let message = body
                            .get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown error")
                            .to_string();
                        return Err(CortoError::Venue { code, message });
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(path, attempt, error = %e, "Binance request error, backing off");
                }
            }

            if attempt < MAX_RETRIES {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        Err(CortoError::VenueUnavailable {
            attempts: MAX_RETRIES,
            last_error,
        })
    }

    // ==================== Account / market data ====================

    /// Free USDT balance; also serves as the startup credential check.
    pub async fn available_balance(&self) -> Result<Decimal> {
        let body = self
            .request(Method::GET, "/fapi/v2/balance", Vec::new(), true)
            .await?;
        let assets = body
            .as_array()
            .ok_or_else(|| CortoError::Internal("balance response not an array".into()))?;
        for asset in assets {
            if asset.get("asset").and_then(Value::as_str) == Some("USDT") {
                return Ok(decimal_field(asset, "availableBalance"));
            }
        }
        Ok(Decimal::ZERO)
    }

    /// Symbol filters, cached after the first lookup.
    pub async fn exchange_info(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.read().await.get(symbol) {
            return Ok(*f);
        }

        let body = self
            .request(Method::GET, "/fapi/v1/exchangeInfo", Vec::new(), false)
            .await?;
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| CortoError::Internal("no symbols in exchangeInfo".into()))?;

        for s in symbols {
            if s.get("symbol").and_then(Value::as_str) != Some(symbol) {
                continue;
            }
            let mut filters = SymbolFilters {
                tick_size: Decimal::new(1, 4),
                step_size: Decimal::new(1, 3),
                min_qty: Decimal::new(1, 3),
                min_notional: Decimal::from(5),
            };
            for f in s.get("filters").and_then(Value::as_array).unwrap_or(&vec![]) {
                match f.get("filterType").and_then(Value::as_str) {
                    Some("PRICE_FILTER") => filters.tick_size = decimal_field(f, "tickSize"),
                    Some("LOT_SIZE") => {
                        filters.step_size = decimal_field(f, "stepSize");
                        filters.min_qty = decimal_field(f, "minQty");
                    }
                    Some("MIN_NOTIONAL") => filters.min_notional = decimal_field(f, "notional"),
                    _ => {}
                }
            }
            debug!(symbol, ?filters, "exchange info cached");
            self.filters.write().await.insert(symbol.to_string(), filters);
            return Ok(filters);
        }

        Err(CortoError::Validation(format!(
            "symbol {} not found in exchangeInfo",
            symbol
        )))
    }

    pub async fn best_bid(&self, symbol: &str) -> Result<Decimal> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/bookTicker",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;
        Ok(decimal_field(&body, "bidPrice"))
    }

    pub async fn best_ask(&self, symbol: &str) -> Result<Decimal> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/ticker/bookTicker",
                vec![("symbol", symbol.to_string())],
                false,
            )
            .await?;
        Ok(decimal_field(&body, "askPrice"))
    }

    // ==================== Pair setup ====================

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.request(
            Method::POST,
            "/fapi/v1/leverage",
            vec![
                ("symbol", symbol.to_string()),
                ("leverage", leverage.to_string()),
            ],
            true,
        )
        .await?;
        info!(symbol, leverage, "leverage configured");
        Ok(())
    }

    /// Idempotent: the venue's "no need to change margin type" reply is
    /// treated as success.
    pub async fn set_margin_type(&self, symbol: &str, margin_type: &str) -> Result<()> {
        match self
            .request(
                Method::POST,
                "/fapi/v1/marginType",
                vec![
                    ("symbol", symbol.to_string()),
                    ("marginType", margin_type.to_string()),
                ],
                true,
            )
            .await
        {
            Ok(_) => {
                info!(symbol, margin_type, "margin type configured");
                Ok(())
            }
            Err(e) if e.venue_code() == Some(CODE_MARGIN_NO_CHANGE) => {
                debug!(symbol, margin_type, "margin type already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ==================== Entry orders ====================

    /// SELL LIMIT to open a short. With `price_match` the venue computes the
    /// price from the book (always passive); with an explicit price the order
    /// is post-only (GTX).
    pub async fn open_short(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        price_match: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "LIMIT".to_string()),
            ("quantity", fmt_decimal(quantity)),
        ];
        if let Some(id) = client_order_id {
            params.push(("newClientOrderId", id.to_string()));
        }
        match (price_match, price) {
            (Some(pm), _) => {
                params.push(("timeInForce", "GTC".to_string()));
                params.push(("priceMatch", pm.to_string()));
                info!(symbol, qty = %quantity, price_match = pm, "entry SELL (BBO)");
            }
            (None, Some(px)) => {
                params.push(("timeInForce", "GTX".to_string()));
                params.push(("price", fmt_decimal(px)));
                info!(symbol, qty = %quantity, price = %px, "entry SELL (post-only)");
            }
            (None, None) => {
                return Err(CortoError::Validation(
                    "open_short requires a price or a priceMatch mode".to_string(),
                ))
            }
        }

        let body = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
        parse_order_ack(&body)
    }

    /// SELL MARKET entry, used as chase fallback.
    pub async fn open_short_market(
        &self,
        symbol: &str,
        quantity: Decimal,
        client_order_id: Option<&str>,
    ) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", fmt_decimal(quantity)),
        ];
        if let Some(id) = client_order_id {
            params.push(("newClientOrderId", id.to_string()));
        }
        info!(symbol, qty = %quantity, "entry SELL MARKET fallback");
        let body = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
        parse_order_ack(&body)
    }

    // ==================== Resident TP / SL ====================

    /// TAKE_PROFIT conditional algo order closing the short once mark price
    /// reaches the trigger. Execution is always passive at the best ask
    /// (`priceMatch=OPPONENT`).
    pub async fn place_tp(
        &self,
        symbol: &str,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "TAKE_PROFIT".to_string()),
            ("algoType", "CONDITIONAL".to_string()),
            ("quantity", fmt_decimal(quantity)),
            ("triggerPrice", fmt_decimal(trigger_price)),
            ("priceMatch", "OPPONENT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
            ("reduceOnly", "true".to_string()),
            ("priceProtect", "true".to_string()),
        ];
        info!(symbol, trigger = %trigger_price, "placing TP algo order");
        let body = self
            .request(Method::POST, "/fapi/v1/algoOrder", params, true)
            .await?;
        parse_order_ack(&body)
    }

    /// STOP_MARKET conditional algo order closing the short at market once
    /// mark price reaches the trigger.
    pub async fn place_sl(
        &self,
        symbol: &str,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("algoType", "CONDITIONAL".to_string()),
            ("quantity", fmt_decimal(quantity)),
            ("triggerPrice", fmt_decimal(trigger_price)),
            ("workingType", "MARK_PRICE".to_string()),
            ("reduceOnly", "true".to_string()),
            ("priceProtect", "true".to_string()),
        ];
        info!(symbol, trigger = %trigger_price, "placing SL algo order");
        let body = self
            .request(Method::POST, "/fapi/v1/algoOrder", params, true)
            .await?;
        parse_order_ack(&body)
    }

    // ==================== Order management ====================

    /// Cancel an order. Falls back to the algo endpoint when the regular one
    /// does not know the id; an order unknown to both is not an error.
    pub async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        info!(symbol, order_id, "cancelling order");
        let result = self
            .request(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
                true,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.venue_code() == Some(CODE_UNKNOWN_ORDER) => {
                let algo = self
                    .request(
                        Method::DELETE,
                        "/fapi/v1/algoOrder",
                        vec![
                            ("symbol", symbol.to_string()),
                            ("algoId", order_id.to_string()),
                        ],
                        true,
                    )
                    .await;
                match algo {
                    Ok(_) => Ok(()),
                    Err(e) if e.venue_code() == Some(CODE_UNKNOWN_ORDER) => {
                        debug!(symbol, order_id, "order already gone");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn query_order(&self, symbol: &str, order_id: i64) -> Result<OrderState> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
                true,
            )
            .await?;
        Ok(OrderState {
            order_id: body.get("orderId").and_then(Value::as_i64).unwrap_or(order_id),
            status: body
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            avg_price: decimal_field(&body, "avgPrice"),
            executed_qty: decimal_field(&body, "executedQty"),
        })
    }

    /// Ids of every open order on the symbol, regular and algo merged.
    pub async fn open_order_ids(&self, symbol: &str) -> Result<HashSet<i64>> {
        let mut ids = HashSet::new();

        let body = self
            .request(
                Method::GET,
                "/fapi/v1/openOrders",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        for o in body.as_array().unwrap_or(&vec![]) {
            if let Some(id) = o.get("orderId").and_then(Value::as_i64) {
                ids.insert(id);
            }
        }

        // Algo orders report `algoId`; a failing algo listing is tolerated.
        match self
            .request(
                Method::GET,
                "/fapi/v1/openAlgoOrders",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await
        {
            Ok(body) => {
                let orders = body
                    .as_array()
                    .cloned()
                    .or_else(|| body.get("orders").and_then(Value::as_array).cloned())
                    .unwrap_or_default();
                for o in &orders {
                    if let Some(id) = o
                        .get("algoId")
                        .and_then(Value::as_i64)
                        .or_else(|| o.get("orderId").and_then(Value::as_i64))
                    {
                        ids.insert(id);
                    }
                }
            }
            Err(e) => debug!(symbol, error = %e, "openAlgoOrders listing failed"),
        }

        Ok(ids)
    }

    // ==================== Positions ====================

    pub async fn position(&self, symbol: &str) -> Result<Option<PositionInfo>> {
        let body = self
            .request(
                Method::GET,
                "/fapi/v2/positionRisk",
                vec![("symbol", symbol.to_string())],
                true,
            )
            .await?;
        Ok(parse_positions(&body).into_iter().next())
    }

    /// Every position with a non-zero amount.
    pub async fn all_positions(&self) -> Result<Vec<PositionInfo>> {
        let body = self
            .request(Method::GET, "/fapi/v2/positionRisk", Vec::new(), true)
            .await?;
        Ok(parse_positions(&body))
    }

    // ==================== Close orders ====================

    /// BUY LIMIT reduceOnly at an explicit price (timeout / manual close).
    pub async fn close_position_limit(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", fmt_decimal(quantity)),
            ("price", fmt_decimal(price)),
            ("reduceOnly", "true".to_string()),
        ];
        info!(symbol, qty = %quantity, price = %price, "close BUY LIMIT");
        let body = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
        parse_order_ack(&body)
    }

    /// BUY reduceOnly priced by the venue at the best ask.
    pub async fn close_position_bbo(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("priceMatch", "OPPONENT".to_string()),
            ("quantity", fmt_decimal(quantity)),
            ("reduceOnly", "true".to_string()),
        ];
        info!(symbol, qty = %quantity, "close BUY (BBO)");
        let body = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
        parse_order_ack(&body)
    }

    /// BUY MARKET reduceOnly, last resort.
    pub async fn close_position_market(&self, symbol: &str, quantity: Decimal) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", fmt_decimal(quantity)),
            ("reduceOnly", "true".to_string()),
        ];
        warn!(symbol, qty = %quantity, "close BUY MARKET");
        let body = self.request(Method::POST, "/fapi/v1/order", params, true).await?;
        parse_order_ack(&body)
    }

    // ==================== User data stream ====================

    pub async fn listen_key(&self) -> Result<String> {
        let body = self
            .request(Method::POST, "/fapi/v1/listenKey", Vec::new(), false)
            .await?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| CortoError::Internal("no listenKey in response".into()))?;
        info!(prefix = &key[..16.min(key.len())], "listen key obtained");
        Ok(key.to_string())
    }

    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<()> {
        self.request(
            Method::PUT,
            "/fapi/v1/listenKey",
            vec![("listenKey", listen_key.to_string())],
            false,
        )
        .await?;
        debug!("listen key renewed");
        Ok(())
    }

    pub async fn close_listen_key(&self, listen_key: &str) -> Result<()> {
        self.request(
            Method::DELETE,
            "/fapi/v1/listenKey",
            vec![("listenKey", listen_key.to_string())],
            false,
        )
        .await?;
        Ok(())
    }
}

fn local_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Exponential backoff with jitter derived from the clock.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 3u64.pow(attempt.saturating_sub(1)) / 2u64.pow(attempt.saturating_sub(1));
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let jitter = seed % (base / 4).max(1);
    Duration::from_millis(base + jitter)
}

fn fmt_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

/// Binance returns numeric values as strings; absent or malformed fields
/// collapse to zero.
fn decimal_field(v: &Value, key: &str) -> Decimal {
    v.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<Decimal>().ok())
        .or_else(|| {
            v.get(key)
                .and_then(Value::as_f64)
                .and_then(Decimal::from_f64_retain)
        })
        .unwrap_or(Decimal::ZERO)
}

fn parse_order_ack(body: &Value) -> Result<OrderAck> {
    let order_id = body
        .get("orderId")
        .and_then(Value::as_i64)
        .or_else(|| body.get("algoId").and_then(Value::as_i64))
        .ok_or_else(|| CortoError::Internal(format!("no orderId in response: {}", body)))?;
    let trigger = decimal_field(body, "triggerPrice");
    let avg = decimal_field(body, "avgPrice");
    Ok(OrderAck {
        order_id,
        status: body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        trigger_price: (trigger > Decimal::ZERO).then_some(trigger),
        avg_price: (avg > Decimal::ZERO).then_some(avg),
    })
}

fn parse_positions(body: &Value) -> Vec<PositionInfo> {
    body.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|p| {
                    let amt = decimal_field(p, "positionAmt");
                    if amt.is_zero() {
                        return None;
                    }
                    Some(PositionInfo {
                        symbol: p.get("symbol").and_then(Value::as_str)?.to_string(),
                        position_amt: amt,
                        entry_price: decimal_field(p, "entryPrice"),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fmt_decimal_trims_trailing_zeros() {
        assert_eq!(fmt_decimal(dec!(0.1000)), "0.1");
        assert_eq!(fmt_decimal(dec!(85.00)), "85");
        assert_eq!(fmt_decimal(dec!(0.0074)), "0.0074");
    }

    #[test]
    fn test_decimal_field_string_and_number() {
        let v = serde_json::json!({"a": "12.5", "b": 3.25, "c": "oops"});
        assert_eq!(decimal_field(&v, "a"), dec!(12.5));
        assert_eq!(decimal_field(&v, "b"), dec!(3.25));
        assert_eq!(decimal_field(&v, "c"), Decimal::ZERO);
        assert_eq!(decimal_field(&v, "missing"), Decimal::ZERO);
    }

    #[test]
    fn test_parse_order_ack_regular_and_algo() {
        let regular = serde_json::json!({"orderId": 42, "status": "NEW"});
        let ack = parse_order_ack(&regular).unwrap();
        assert_eq!(ack.order_id, 42);
        assert_eq!(ack.status, "NEW");
        assert!(ack.trigger_price.is_none());

        let algo = serde_json::json!({"algoId": 7, "triggerPrice": "85.00"});
        let ack = parse_order_ack(&algo).unwrap();
        assert_eq!(ack.order_id, 7);
        assert_eq!(ack.trigger_price, Some(dec!(85.00)));

        assert!(parse_order_ack(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_positions_filters_flat() {
        let body = serde_json::json!([
            {"symbol": "AAAUSDT", "positionAmt": "-0.1", "entryPrice": "100.0"},
            {"symbol": "BBBUSDT", "positionAmt": "0", "entryPrice": "0"},
        ]);
        let positions = parse_positions(&body);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "AAAUSDT");
        assert_eq!(positions[0].position_amt, dec!(-0.1));
    }

    #[test]
    fn test_backoff_grows() {
        assert!(backoff_delay(2) > backoff_delay(1));
        assert!(backoff_delay(3) > backoff_delay(2));
    }
}
