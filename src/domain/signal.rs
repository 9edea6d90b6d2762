use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A short-side candidate emitted by the external pair selector.
///
/// One row of the shared signal CSV. Immutable once read: it is either
/// accepted (spawning a [`crate::domain::Trade`]) or discarded; the only
/// mutation ever applied to the file is flipping its `leido` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Raw `fecha_hora` value as written by the selector (`YYYY/MM/DD HH:MM:SS`)
    pub fecha_hora: String,
    pub pair: String,
    /// Rank within the selector batch (CSV column `top`, 1 = best)
    pub rank: u32,
    pub close: Decimal,
    pub mom_1h_pct: f64,
    pub mom_pct: f64,
    pub vol_ratio: f64,
    pub trades_ratio: f64,
    /// Market-cap quintile, 1 (smallest) through 5 (largest); 0 when absent
    pub quintil: u8,
    /// Parsed signal timestamp (UTC)
    pub signal_dt: DateTime<Utc>,
}

impl Signal {
    /// Key identifying this signal's CSV row across a re-read of the file.
    pub fn row_key(&self) -> (String, String, String) {
        (
            self.fecha_hora.clone(),
            self.pair.clone(),
            self.rank.to_string(),
        )
    }
}
