//! Signal CSV poller.
//!
//! Watches the selector's shared CSV and feeds fresh, filter-passing rows to
//! the engine. Only rows the engine actually admits are marked `leido=si`;
//! the rewrite is atomic (sibling temp file + rename) and touches nothing
//! but the `leido` column, so the selector can keep appending concurrently.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::Signal;
use crate::engine::TradeEngine;
use crate::error::Result;

type RowKey = (String, String, String);

pub struct SignalWatcher {
    cfg: Arc<AppConfig>,
    engine: Arc<TradeEngine>,
}

impl SignalWatcher {
    pub fn new(cfg: Arc<AppConfig>, engine: Arc<TradeEngine>) -> Self {
        Self { cfg, engine }
    }

    /// Poll loop; exits when `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval =
            std::time::Duration::from_secs_f64(self.cfg.signals.poll_interval_seconds);
        let path = PathBuf::from(&self.cfg.signals.file_path);
        info!(path = %path.display(), ?interval, "signal watcher started");

        let mut last_mtime: Option<SystemTime> = None;

        loop {
            if let Err(e) = self.check_file(&path, &mut last_mtime).await {
                error!(error = %e, "signal poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("signal watcher stopped");
    }

    async fn check_file(
        &self,
        path: &Path,
        last_mtime: &mut Option<SystemTime>,
    ) -> Result<()> {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return Ok(());
        };
        let mtime = meta.modified()?;
        if Some(mtime) == *last_mtime {
            return Ok(());
        }
        *last_mtime = Some(mtime);

        let bytes = tokio::fs::read(path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let signals = parse_signals(
            &text,
            Utc::now(),
            self.cfg.signals.max_signal_age_minutes,
            self.cfg.strategy.top_n,
        );

        let mut accepted: HashSet<RowKey> = HashSet::new();
        for signal in signals {
            if let Some(reason) = reject_reason(&signal, &self.cfg.strategy) {
                info!(pair = %signal.pair, reason, "signal filtered out");
                continue;
            }
            info!(
                pair = %signal.pair,
                rank = signal.rank,
                mom_1h_pct = signal.mom_1h_pct,
                vol_ratio = signal.vol_ratio,
                "signal passed filters"
            );
            match self.engine.on_signal(signal.clone()).await {
                Ok(true) => {
                    accepted.insert(signal.row_key());
                }
                Ok(false) => {}
                Err(e) => error!(pair = %signal.pair, error = %e, "signal handling failed"),
            }
        }

        if !accepted.is_empty() {
            mark_read(path, &accepted).await?;
            // The rewrite changes the mtime; remember it so the next poll
            // does not re-read our own write.
            if let Ok(meta) = tokio::fs::metadata(path).await {
                *last_mtime = meta.modified().ok();
            }
        }
        Ok(())
    }
}

/// Flip `leido` to `si` for the keyed rows. The file is re-read at write
/// time (the selector may have appended rows since the poll) and replaced
/// atomically via a sibling temp file + rename.
async fn mark_read(path: &Path, keys: &HashSet<RowKey>) -> Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes).into_owned();

    let Some(updated) = rewrite_marked(&text, keys) else {
        warn!("signal CSV changed shape, skipping leido update");
        return Ok(());
    };

    let tmp = path.with_extension("csv.tmp");
    tokio::fs::write(&tmp, updated).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(count = keys.len(), "signal rows marked as read");
    Ok(())
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn header_index(headers: &[String], names: &[&str]) -> Option<usize> {
    headers
        .iter()
        .position(|h| names.iter().any(|n| h.eq_ignore_ascii_case(n)))
}

/// Parse unread rows into signals, dropping stale and over-rank rows.
/// Rows dropped here keep `leido=no`.
fn parse_signals(
    text: &str,
    now: DateTime<Utc>,
    max_age_minutes: f64,
    top_n: u32,
) -> Vec<Signal> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(strip_bom(text).as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.trim().to_string()).collect(),
        Err(e) => {
            warn!(error = %e, "unreadable signal CSV header");
            return Vec::new();
        }
    };

    let Some(idx_fecha) = header_index(&headers, &["fecha_hora"]) else {
        warn!("signal CSV missing fecha_hora column");
        return Vec::new();
    };
    let Some(idx_pair) = header_index(&headers, &["pair", "par"]) else {
        warn!("signal CSV missing pair column");
        return Vec::new();
    };
    let Some(idx_leido) = header_index(&headers, &["leido"]) else {
        warn!("signal CSV missing leido column");
        return Vec::new();
    };
    let idx_rank = header_index(&headers, &["rank", "top"]);
    let idx_close = header_index(&headers, &["close"]);
    let idx_mom_1h = header_index(&headers, &["mom_1h_pct"]);
    let idx_mom = header_index(&headers, &["mom_pct"]);
    let idx_vol = header_index(&headers, &["vol_ratio"]);
    let idx_trades = header_index(&headers, &["trades_ratio"]);
    let idx_quintil = header_index(&headers, &["quintil"]);

    let field = |record: &csv::StringRecord, idx: Option<usize>| -> String {
        idx.and_then(|i| record.get(i)).unwrap_or("").trim().to_string()
    };
    let num = |record: &csv::StringRecord, idx: Option<usize>| -> f64 {
        field(record, idx).parse::<f64>().unwrap_or(0.0)
    };

    let mut signals = Vec::new();
    for record in reader.records().flatten() {
        if !field(&record, Some(idx_leido)).eq_ignore_ascii_case("no") {
            continue;
        }

        let fecha_hora = field(&record, Some(idx_fecha));
        let pair = field(&record, Some(idx_pair));
        if pair.is_empty() {
            continue;
        }

        let Ok(naive) = NaiveDateTime::parse_from_str(&fecha_hora, "%Y/%m/%d %H:%M:%S")
        else {
            warn!(pair = %pair, fecha_hora = %fecha_hora, "bad signal timestamp");
            continue;
        };
        let signal_dt = naive.and_utc();

        let age_minutes = (now - signal_dt).num_seconds() as f64 / 60.0;
        if age_minutes > max_age_minutes {
            info!(
                pair = %pair,
                age_minutes = format!("{:.1}", age_minutes),
                "signal too old, dropped"
            );
            continue;
        }

        let rank = field(&record, idx_rank).parse::<u32>().unwrap_or(0);
        if rank == 0 || rank > top_n {
            continue;
        }

        signals.push(Signal {
            fecha_hora,
            pair,
            rank,
            close: field(&record, idx_close).parse().unwrap_or_default(),
            mom_1h_pct: num(&record, idx_mom_1h),
            mom_pct: num(&record, idx_mom),
            vol_ratio: num(&record, idx_vol),
            trades_ratio: num(&record, idx_trades),
            quintil: num(&record, idx_quintil) as u8,
            signal_dt,
        });
    }
    signals
}

/// Why a parsed signal fails the strategy filters, or `None` if it passes.
fn reject_reason(
    signal: &Signal,
    strategy: &crate::config::StrategyConfig,
) -> Option<String> {
    if signal.mom_1h_pct < strategy.min_momentum_pct {
        return Some(format!(
            "mom_1h_pct={:.2} < {}",
            signal.mom_1h_pct, strategy.min_momentum_pct
        ));
    }
    if strategy.min_vol_ratio > 0.0 && signal.vol_ratio < strategy.min_vol_ratio {
        return Some(format!(
            "vol_ratio={:.2} < {}",
            signal.vol_ratio, strategy.min_vol_ratio
        ));
    }
    if strategy.min_trades_ratio > 0.0 && signal.trades_ratio < strategy.min_trades_ratio {
        return Some(format!(
            "trades_ratio={:.2} < {}",
            signal.trades_ratio, strategy.min_trades_ratio
        ));
    }
    if signal.quintil != 0 && !strategy.allowed_quintiles.contains(&signal.quintil) {
        return Some(format!(
            "quintil={} not in {:?}",
            signal.quintil, strategy.allowed_quintiles
        ));
    }
    None
}

/// Rewrite the CSV text with `leido=si` on the keyed rows, preserving every
/// other byte (extra columns, line endings, BOM). Returns `None` when the
/// header no longer carries the expected columns.
fn rewrite_marked(text: &str, keys: &HashSet<RowKey>) -> Option<String> {
    let (bom, body) = match text.strip_prefix('\u{feff}') {
        Some(rest) => ("\u{feff}", rest),
        None => ("", text),
    };

    let mut lines = body.split_inclusive('\n');
    let header_line = lines.next()?;
    let headers: Vec<String> = header_line
        .trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|h| h.trim().to_string())
        .collect();

    let idx_fecha = header_index(&headers, &["fecha_hora"])?;
    let idx_pair = header_index(&headers, &["pair", "par"])?;
    let idx_rank = header_index(&headers, &["rank", "top"])?;
    let idx_leido = header_index(&headers, &["leido"])?;

    let mut out = String::with_capacity(text.len());
    out.push_str(bom);
    out.push_str(header_line);

    for line in lines {
        let stripped = line.trim_end_matches(['\r', '\n']);
        if stripped.is_empty() {
            out.push_str(line);
            continue;
        }
        let ending = &line[stripped.len()..];
        let mut parts: Vec<&str> = stripped.split(',').collect();

        let key = (
            parts.get(idx_fecha).map(|s| s.trim()).unwrap_or("").to_string(),
            parts.get(idx_pair).map(|s| s.trim()).unwrap_or("").to_string(),
            parts.get(idx_rank).map(|s| s.trim()).unwrap_or("").to_string(),
        );

        if keys.contains(&key) && idx_leido < parts.len() {
            parts[idx_leido] = "si";
            out.push_str(&parts.join(","));
            out.push_str(ending);
        } else {
            out.push_str(line);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HEADER: &str =
        "fecha_hora,par,top,close,mom_1h_pct,mom_pct,vol_ratio,trades_ratio,quintil,extra,leido";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap()
    }

    fn strategy() -> crate::config::StrategyConfig {
        use rust_decimal_macros::dec;
        crate::config::StrategyConfig {
            capital_per_trade: dec!(10),
            leverage: 1,
            tp_pct: dec!(15),
            sl_pct: dec!(60),
            timeout_hours: 24.0,
            max_open_trades: 10,
            max_trades_per_pair: 1,
            top_n: 2,
            min_momentum_pct: 5.0,
            min_vol_ratio: 2.0,
            min_trades_ratio: 0.0,
            allowed_quintiles: vec![1, 2, 3],
            trigger_offset_pct: 10.0,
        }
    }

    #[test]
    fn test_parse_fresh_unread_rows() {
        let csv = format!(
            "{HEADER}\n\
             2025/06/01 12:00:00,AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,x,no\n\
             2025/06/01 12:00:00,BBBUSDT,2,1.2,9.0,4.0,2.5,1.0,1,y,si\n"
        );
        let signals = parse_signals(&csv, now(), 10.0, 2);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].pair, "AAAUSDT");
        assert_eq!(signals[0].rank, 1);
        assert_eq!(signals[0].mom_1h_pct, 12.5);
    }

    #[test]
    fn test_stale_signal_dropped() {
        let csv = format!(
            "{HEADER}\n\
             2025/06/01 11:00:00,AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,x,no\n"
        );
        // 65 minutes old, max age 10
        assert!(parse_signals(&csv, now(), 10.0, 2).is_empty());
    }

    #[test]
    fn test_rank_over_top_n_dropped() {
        let csv = format!(
            "{HEADER}\n\
             2025/06/01 12:00:00,AAAUSDT,3,0.5,12.5,8.0,3.0,2.0,2,x,no\n"
        );
        assert!(parse_signals(&csv, now(), 10.0, 2).is_empty());
    }

    #[test]
    fn test_bom_and_padded_headers_tolerated() {
        let csv = format!(
            "\u{feff}fecha_hora, par, top,close,mom_1h_pct,mom_pct,vol_ratio,trades_ratio,quintil, leido\n\
             2025/06/01 12:00:00,AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,no\n"
        );
        let signals = parse_signals(&csv, now(), 10.0, 2);
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn test_filters() {
        let strategy = strategy();
        let mut signal = Signal {
            fecha_hora: "2025/06/01 12:00:00".into(),
            pair: "AAAUSDT".into(),
            rank: 1,
            close: Default::default(),
            mom_1h_pct: 12.5,
            mom_pct: 8.0,
            vol_ratio: 3.0,
            trades_ratio: 2.0,
            quintil: 2,
            signal_dt: now(),
        };
        assert!(reject_reason(&signal, &strategy).is_none());

        signal.mom_1h_pct = 4.0;
        assert!(reject_reason(&signal, &strategy).unwrap().contains("mom_1h_pct"));
        signal.mom_1h_pct = 12.5;

        signal.vol_ratio = 1.0;
        assert!(reject_reason(&signal, &strategy).unwrap().contains("vol_ratio"));
        signal.vol_ratio = 3.0;

        signal.quintil = 5;
        assert!(reject_reason(&signal, &strategy).unwrap().contains("quintil"));
    }

    #[test]
    fn test_rewrite_marks_only_keyed_rows() {
        let csv = format!(
            "{HEADER}\r\n\
             2025/06/01 12:00:00,AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,keepme,no\r\n\
             2025/06/01 12:00:00,BBBUSDT,2,1.2,9.0,4.0,2.5,1.0,1,other,no\r\n"
        );
        let mut keys = HashSet::new();
        keys.insert((
            "2025/06/01 12:00:00".to_string(),
            "AAAUSDT".to_string(),
            "1".to_string(),
        ));
        let updated = rewrite_marked(&csv, &keys).unwrap();

        assert!(updated.contains("AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,keepme,si\r\n"));
        // Untouched row is byte-identical, extra column preserved
        assert!(updated.contains("BBBUSDT,2,1.2,9.0,4.0,2.5,1.0,1,other,no\r\n"));
        assert!(updated.starts_with(HEADER));
    }

    #[test]
    fn test_rewrite_skips_vanished_rows() {
        let csv = format!("{HEADER}\n2025/06/01 12:00:00,BBBUSDT,1,1,1,1,1,1,1,z,no\n");
        let mut keys = HashSet::new();
        keys.insert((
            "2025/06/01 12:00:00".to_string(),
            "AAAUSDT".to_string(),
            "1".to_string(),
        ));
        let updated = rewrite_marked(&csv, &keys).unwrap();
        assert_eq!(updated, csv);
    }

    #[test]
    fn test_rewrite_preserves_bom() {
        let csv = format!("\u{feff}{HEADER}\n2025/06/01 12:00:00,AAAUSDT,1,1,1,1,1,1,1,z,no\n");
        let keys = HashSet::new();
        let updated = rewrite_marked(&csv, &keys).unwrap();
        assert!(updated.starts_with('\u{feff}'));
        assert_eq!(updated, csv);
    }

    #[tokio::test]
    async fn test_mark_read_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fut_pares_short.csv");
        let csv = format!(
            "{HEADER}\n\
             2025/06/01 12:00:00,AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,x,no\n\
             2025/06/01 12:00:00,BBBUSDT,2,1.2,9.0,4.0,2.5,1.0,1,y,no\n"
        );
        tokio::fs::write(&path, &csv).await.unwrap();

        let mut keys = HashSet::new();
        keys.insert((
            "2025/06/01 12:00:00".to_string(),
            "AAAUSDT".to_string(),
            "1".to_string(),
        ));
        mark_read(&path, &keys).await.unwrap();

        let after = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(after.contains("AAAUSDT,1,0.5,12.5,8.0,3.0,2.0,2,x,si\n"));
        assert!(after.contains("BBBUSDT,2,1.2,9.0,4.0,2.5,1.0,1,y,no\n"));
        // No temp file left behind
        assert!(!path.with_extension("csv.tmp").exists());
    }
}
