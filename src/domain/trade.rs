use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Signal;

/// Trade lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Signal accepted, trade row persisted, entry not yet attempted
    SignalReceived,
    /// Entry chase loop running
    Opening,
    /// Entry never filled; no position at the venue
    NotExecuted,
    /// Entry filled, TP/SL resident at the venue
    Open,
    /// An exit has been resolved and is being finalized
    Closing,
    /// Position closed, PnL computed
    Closed,
    /// Unrecoverable failure; requires operator intervention
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::SignalReceived => "signal_received",
            TradeStatus::Opening => "opening",
            TradeStatus::NotExecuted => "not_executed",
            TradeStatus::Open => "open",
            TradeStatus::Closing => "closing",
            TradeStatus::Closed => "closed",
            TradeStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Closed | TradeStatus::NotExecuted | TradeStatus::Error
        )
    }

    /// Legal forward transitions of the state machine. `Error` is reachable
    /// from any non-terminal state.
    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        if next == TradeStatus::Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (TradeStatus::SignalReceived, TradeStatus::Opening)
                | (TradeStatus::Opening, TradeStatus::Open)
                | (TradeStatus::Opening, TradeStatus::NotExecuted)
                | (TradeStatus::Open, TradeStatus::Closing)
                | (TradeStatus::Closing, TradeStatus::Closed)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "signal_received" => Ok(TradeStatus::SignalReceived),
            "opening" => Ok(TradeStatus::Opening),
            "not_executed" => Ok(TradeStatus::NotExecuted),
            "open" => Ok(TradeStatus::Open),
            "closing" => Ok(TradeStatus::Closing),
            "closed" => Ok(TradeStatus::Closed),
            "error" => Ok(TradeStatus::Error),
            other => Err(format!("unknown trade status: {}", other)),
        }
    }
}

/// How an open trade was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    Tp,
    Sl,
    Timeout,
    Manual,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::Tp => "tp",
            ExitType::Sl => "sl",
            ExitType::Timeout => "timeout",
            ExitType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExitType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tp" => Ok(ExitType::Tp),
            "sl" => Ok(ExitType::Sl),
            "timeout" => Ok(ExitType::Timeout),
            "manual" => Ok(ExitType::Manual),
            other => Err(format!("unknown exit type: {}", other)),
        }
    }
}

/// The central entity: one short position lifecycle, from accepted signal to
/// terminal state. `pair` and `signal_data` are immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub pair: String,
    /// Signal timestamp as written in the CSV
    pub signal_ts: String,
    /// Originating signal preserved verbatim, unknown fields included
    pub signal_data: serde_json::Value,

    // Entry
    pub entry_order_id: Option<i64>,
    pub entry_price: Option<Decimal>,
    pub entry_quantity: Option<Decimal>,
    pub entry_fill_ts: Option<DateTime<Utc>>,
    pub entry_commission: Option<Decimal>,

    // Venue-resident exit orders
    pub tp_order_id: Option<i64>,
    pub sl_order_id: Option<i64>,
    pub tp_trigger_price: Option<Decimal>,
    pub sl_trigger_price: Option<Decimal>,

    // Exit
    pub exit_price: Option<Decimal>,
    pub exit_fill_ts: Option<DateTime<Utc>>,
    pub exit_type: Option<ExitType>,
    pub exit_commission: Option<Decimal>,
    pub pnl_usdt: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub fees_usdt: Option<Decimal>,

    pub status: TradeStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    pub fn from_signal(signal: &Signal) -> Self {
        let now = Utc::now();
        let signal_data =
            serde_json::to_value(signal).unwrap_or(serde_json::Value::Null);
        Self {
            trade_id: Uuid::new_v4().to_string(),
            pair: signal.pair.clone(),
            signal_ts: signal.fecha_hora.clone(),
            signal_data,
            entry_order_id: None,
            entry_price: None,
            entry_quantity: None,
            entry_fill_ts: None,
            entry_commission: None,
            tp_order_id: None,
            sl_order_id: None,
            tp_trigger_price: None,
            sl_trigger_price: None,
            exit_price: None,
            exit_fill_ts: None,
            exit_type: None,
            exit_commission: None,
            pnl_usdt: None,
            pnl_pct: None,
            fees_usdt: None,
            status: TradeStatus::SignalReceived,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Short identifier for log lines
    pub fn short_id(&self) -> &str {
        &self.trade_id[..8.min(self.trade_id.len())]
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Transition to `next`, refusing anything the state machine does not
    /// allow. Updates `updated_at` on success.
    pub fn transition(&mut self, next: TradeStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::CortoError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal() -> Signal {
        use rust_decimal_macros::dec;
        Signal {
            fecha_hora: "2025/06/01 12:00:00".to_string(),
            pair: "AAAUSDT".to_string(),
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

    #[test]
    fn test_status_roundtrip() {
        for s in [
            TradeStatus::SignalReceived,
            TradeStatus::Opening,
            TradeStatus::NotExecuted,
            TradeStatus::Open,
            TradeStatus::Closing,
            TradeStatus::Closed,
            TradeStatus::Error,
        ] {
            assert_eq!(s.as_str().parse::<TradeStatus>().unwrap(), s);
        }
    }

    #[test]
    fn test_forward_transitions_only() {
        assert!(TradeStatus::SignalReceived.can_transition_to(TradeStatus::Opening));
        assert!(TradeStatus::Opening.can_transition_to(TradeStatus::Open));
        assert!(TradeStatus::Opening.can_transition_to(TradeStatus::NotExecuted));
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Closing));
        assert!(TradeStatus::Closing.can_transition_to(TradeStatus::Closed));

        // No backward transitions
        assert!(!TradeStatus::Open.can_transition_to(TradeStatus::Opening));
        assert!(!TradeStatus::Closed.can_transition_to(TradeStatus::Open));
        assert!(!TradeStatus::Closing.can_transition_to(TradeStatus::Open));

        // Error reachable from any non-terminal state, but not from terminal
        assert!(TradeStatus::Open.can_transition_to(TradeStatus::Error));
        assert!(TradeStatus::Opening.can_transition_to(TradeStatus::Error));
        assert!(!TradeStatus::Closed.can_transition_to(TradeStatus::Error));
        assert!(!TradeStatus::NotExecuted.can_transition_to(TradeStatus::Error));
    }

    #[test]
    fn test_transition_enforced() {
        let mut t = Trade::from_signal(&sample_signal());
        assert_eq!(t.status, TradeStatus::SignalReceived);
        t.transition(TradeStatus::Opening).unwrap();
        t.transition(TradeStatus::Open).unwrap();
        assert!(t.transition(TradeStatus::Opening).is_err());
        t.transition(TradeStatus::Closing).unwrap();
        t.transition(TradeStatus::Closed).unwrap();
        assert!(t.transition(TradeStatus::Error).is_err());
    }

    #[test]
    fn test_signal_data_preserved() {
        let sig = sample_signal();
        let t = Trade::from_signal(&sig);
        assert_eq!(t.pair, "AAAUSDT");
        assert_eq!(t.signal_data["pair"], "AAAUSDT");
        assert_eq!(t.signal_data["rank"], 1);
    }
}
