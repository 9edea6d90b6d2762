use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

use crate::error::{CortoError, Result};

/// Main configuration structure, loaded from `config.yaml` layered with
/// `CORTO__*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub binance: BinanceConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    /// REST base, e.g. `https://fapi.binance.com` or the futures testnet
    pub base_url: String,
    #[serde(default = "default_recv_window")]
    pub recv_window: u64,
}

impl BinanceConfig {
    /// User-data stream host matching the configured REST base.
    pub fn ws_base_url(&self) -> &'static str {
        if self.base_url.contains("fapi.binance.com") {
            "wss://fstream.binance.com"
        } else {
            "wss://stream.binancefuture.com"
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Quote-asset capital committed per trade (margin, pre-leverage)
    pub capital_per_trade: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    pub tp_pct: Decimal,
    pub sl_pct: Decimal,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: f64,
    pub max_open_trades: usize,
    #[serde(default = "default_max_trades_per_pair")]
    pub max_trades_per_pair: usize,
    #[serde(default = "default_top_n")]
    pub top_n: u32,
    #[serde(default)]
    pub min_momentum_pct: f64,
    #[serde(default)]
    pub min_vol_ratio: f64,
    #[serde(default)]
    pub min_trades_ratio: f64,
    #[serde(default = "default_allowed_quintiles")]
    pub allowed_quintiles: Vec<u8>,
    /// Historical knob from the pre-algo-order SL design; no longer read.
    #[serde(default = "default_trigger_offset_pct")]
    pub trigger_offset_pct: f64,
}

impl StrategyConfig {
    /// Validate config invariants. Returns list of problems (empty = valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.capital_per_trade <= Decimal::ZERO {
            errors.push(format!(
                "strategy.capital_per_trade must be > 0, got {}",
                self.capital_per_trade
            ));
        }
        if self.leverage == 0 || self.leverage > 125 {
            errors.push(format!(
                "strategy.leverage must be in 1..=125, got {}",
                self.leverage
            ));
        }
        if self.tp_pct <= Decimal::ZERO || self.tp_pct >= Decimal::ONE_HUNDRED {
            errors.push(format!(
                "strategy.tp_pct must be in (0, 100), got {}",
                self.tp_pct
            ));
        }
        if self.sl_pct <= Decimal::ZERO {
            errors.push(format!("strategy.sl_pct must be > 0, got {}", self.sl_pct));
        }
        if self.timeout_hours <= 0.0 {
            errors.push(format!(
                "strategy.timeout_hours must be > 0, got {}",
                self.timeout_hours
            ));
        }
        if self.max_open_trades == 0 {
            errors.push("strategy.max_open_trades must be > 0".to_string());
        }
        if self.max_trades_per_pair == 0 {
            errors.push("strategy.max_trades_per_pair must be > 0".to_string());
        }
        if self.allowed_quintiles.iter().any(|q| *q < 1 || *q > 5) {
            errors.push(format!(
                "strategy.allowed_quintiles must contain values 1..=5, got {:?}",
                self.allowed_quintiles
            ));
        }
        errors
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalsConfig {
    #[serde(default = "default_signals_file")]
    pub file_path: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: f64,
    #[serde(default = "default_max_signal_age")]
    pub max_signal_age_minutes: f64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            file_path: default_signals_file(),
            poll_interval_seconds: default_poll_interval(),
            max_signal_age_minutes: default_max_signal_age(),
        }
    }
}

/// Entry order style for the chase loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryOrderType {
    /// Venue-priced passive limit (`priceMatch`)
    Bbo,
    /// Post-only limit at the current best bid
    LimitGtx,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_entry_order_type")]
    pub order_type: EntryOrderType,
    #[serde(default = "default_chase_interval")]
    pub chase_interval_seconds: f64,
    #[serde(default = "default_chase_timeout")]
    pub chase_timeout_seconds: f64,
    #[serde(default = "default_max_chase_attempts")]
    pub max_chase_attempts: u32,
    #[serde(default)]
    pub market_fallback: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            order_type: default_entry_order_type(),
            chase_interval_seconds: default_chase_interval(),
            chase_timeout_seconds: default_chase_timeout(),
            max_chase_attempts: default_max_chase_attempts(),
            market_fallback: false,
        }
    }
}

/// Close order style for timeout and manual exits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutOrderType {
    Bbo,
    Limit,
    Market,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "default_timeout_order_type")]
    pub timeout_order_type: TimeoutOrderType,
    #[serde(default = "default_timeout_chase")]
    pub timeout_chase_seconds: f64,
    #[serde(default = "default_timeout_market_fallback")]
    pub timeout_market_fallback: bool,
    /// Historical knob from the mark-price polling SL design; no longer read.
    #[serde(default = "default_sl_mark_poll_interval")]
    pub sl_mark_poll_interval: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            timeout_order_type: default_timeout_order_type(),
            timeout_chase_seconds: default_timeout_chase(),
            timeout_market_fallback: default_timeout_market_fallback(),
            sl_mark_poll_interval: default_sl_mark_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_host")]
    pub host: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_dashboard_host(),
            port: default_dashboard_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl AppConfig {
    /// Load configuration from a YAML file, layered with environment
    /// variables (`CORTO__SECTION__KEY`). Fails on a missing file, missing
    /// required field, or failed validation.
    pub fn load_from(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(CortoError::ConfigValidation(format!(
                "config file not found: {}",
                path
            )));
        }

        let cfg: AppConfig = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("CORTO").separator("__"))
            .build()?
            .try_deserialize()?;

        let errors = cfg.validate();
        if !errors.is_empty() {
            return Err(CortoError::ConfigValidation(errors.join("; ")));
        }
        Ok(cfg)
    }

    /// Validate config invariants across all sections.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.binance.api_key.trim().is_empty() {
            errors.push("binance.api_key must not be empty".to_string());
        }
        if self.binance.api_secret.trim().is_empty() {
            errors.push("binance.api_secret must not be empty".to_string());
        }
        if self.binance.base_url.trim().is_empty() {
            errors.push("binance.base_url must not be empty".to_string());
        }
        if self.database.path.trim().is_empty() {
            errors.push("database.path must not be empty".to_string());
        }
        if self.signals.file_path.trim().is_empty() {
            errors.push("signals.file_path must not be empty".to_string());
        }
        if self.signals.poll_interval_seconds <= 0.0 {
            errors.push("signals.poll_interval_seconds must be > 0".to_string());
        }
        if self.entry.max_chase_attempts == 0 {
            errors.push("entry.max_chase_attempts must be > 0".to_string());
        }
        errors.extend(self.strategy.validate());
        errors
    }

    /// Warn about accepted-but-inapplicable fields when they deviate from
    /// their historical defaults, instead of silently ignoring them.
    pub fn warn_inapplicable(&self) {
        if (self.strategy.trigger_offset_pct - default_trigger_offset_pct()).abs() > f64::EPSILON {
            warn!(
                value = self.strategy.trigger_offset_pct,
                "strategy.trigger_offset_pct is set but no longer applies: \
                 TP/SL triggers are venue-resident algo orders"
            );
        }
        if (self.exit.sl_mark_poll_interval - default_sl_mark_poll_interval()).abs() > f64::EPSILON
        {
            warn!(
                value = self.exit.sl_mark_poll_interval,
                "exit.sl_mark_poll_interval is set but no longer applies: \
                 the SL is a venue-resident STOP_MARKET algo order"
            );
        }
    }

    /// Config snapshot for the dashboard, credentials redacted.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "binance": {
                "base_url": self.binance.base_url,
                "recv_window": self.binance.recv_window,
            },
            "strategy": {
                "capital_per_trade": self.strategy.capital_per_trade,
                "leverage": self.strategy.leverage,
                "tp_pct": self.strategy.tp_pct,
                "sl_pct": self.strategy.sl_pct,
                "timeout_hours": self.strategy.timeout_hours,
                "max_open_trades": self.strategy.max_open_trades,
                "max_trades_per_pair": self.strategy.max_trades_per_pair,
                "top_n": self.strategy.top_n,
                "min_momentum_pct": self.strategy.min_momentum_pct,
                "min_vol_ratio": self.strategy.min_vol_ratio,
                "min_trades_ratio": self.strategy.min_trades_ratio,
                "allowed_quintiles": self.strategy.allowed_quintiles,
            },
            "signals": {
                "file_path": self.signals.file_path,
                "poll_interval_seconds": self.signals.poll_interval_seconds,
                "max_signal_age_minutes": self.signals.max_signal_age_minutes,
            },
            "entry": {
                "order_type": format!("{:?}", self.entry.order_type),
                "chase_interval_seconds": self.entry.chase_interval_seconds,
                "chase_timeout_seconds": self.entry.chase_timeout_seconds,
                "max_chase_attempts": self.entry.max_chase_attempts,
                "market_fallback": self.entry.market_fallback,
            },
            "exit": {
                "timeout_order_type": format!("{:?}", self.exit.timeout_order_type),
                "timeout_chase_seconds": self.exit.timeout_chase_seconds,
                "timeout_market_fallback": self.exit.timeout_market_fallback,
            },
            "dashboard": {
                "enabled": self.dashboard.enabled,
                "host": self.dashboard.host,
                "port": self.dashboard.port,
            },
            "database": { "path": self.database.path },
        })
    }
}

fn default_recv_window() -> u64 {
    5000
}

fn default_leverage() -> u32 {
    1
}

fn default_timeout_hours() -> f64 {
    24.0
}

fn default_max_trades_per_pair() -> usize {
    1
}

fn default_top_n() -> u32 {
    1
}

fn default_allowed_quintiles() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

fn default_trigger_offset_pct() -> f64 {
    10.0
}

fn default_signals_file() -> String {
    "fut_pares_short.csv".to_string()
}

fn default_poll_interval() -> f64 {
    15.0
}

fn default_max_signal_age() -> f64 {
    10.0
}

fn default_entry_order_type() -> EntryOrderType {
    EntryOrderType::LimitGtx
}

fn default_chase_interval() -> f64 {
    2.0
}

fn default_chase_timeout() -> f64 {
    30.0
}

fn default_max_chase_attempts() -> u32 {
    3
}

fn default_timeout_order_type() -> TimeoutOrderType {
    TimeoutOrderType::Limit
}

fn default_timeout_chase() -> f64 {
    30.0
}

fn default_timeout_market_fallback() -> bool {
    true
}

fn default_sl_mark_poll_interval() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_dashboard_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dashboard_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> AppConfig {
        AppConfig {
            binance: BinanceConfig {
                api_key: "k".into(),
                api_secret: "s".into(),
                base_url: "https://testnet.binancefuture.com".into(),
                recv_window: 5000,
            },
            strategy: StrategyConfig {
                capital_per_trade: dec!(10),
                leverage: 1,
                tp_pct: dec!(15),
                sl_pct: dec!(60),
                timeout_hours: 24.0,
                max_open_trades: 10,
                max_trades_per_pair: 1,
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
            database: DatabaseConfig {
                path: "data/corto.db".into(),
            },
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(sample().validate().is_empty());
    }

    #[test]
    fn test_invalid_config_collects_errors() {
        let mut cfg = sample();
        cfg.strategy.capital_per_trade = dec!(0);
        cfg.strategy.tp_pct = dec!(0);
        cfg.binance.api_key = "".into();
        let errors = cfg.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_ws_base_url_from_rest_base() {
        let mut cfg = sample();
        assert_eq!(cfg.binance.ws_base_url(), "wss://stream.binancefuture.com");
        cfg.binance.base_url = "https://fapi.binance.com".into();
        assert_eq!(cfg.binance.ws_base_url(), "wss://fstream.binance.com");
    }

    #[test]
    fn test_redacted_has_no_credentials() {
        let redacted = sample().redacted();
        let text = redacted.to_string();
        assert!(!text.contains("api_key"));
        assert!(!text.contains("api_secret"));
    }
}
