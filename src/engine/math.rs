//! Price/quantity rounding and PnL arithmetic.
//!
//! Quantities round DOWN to the lot step (never oversize a position);
//! trigger prices round to the nearest tick.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Taker/maker fee per side assumed when the venue did not report the
/// commission on the fill event.
pub const DEFAULT_FEE_RATE: Decimal = dec!(0.0004);

/// Round `value` down to the nearest multiple of `step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    ((value / step).floor() * step).normalize()
}

/// Round `value` to the nearest multiple of `tick`.
pub fn round_to_tick(value: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return value;
    }
    ((value / tick).round() * tick).normalize()
}

/// Entry quantity for a short: `(capital × leverage) / price`, floored to
/// the lot step.
pub fn entry_quantity(
    capital: Decimal,
    leverage: u32,
    price: Decimal,
    step: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    floor_to_step(capital * Decimal::from(leverage) / price, step)
}

/// TP trigger for a short: `entry × (1 − tp_pct/100)`, rounded to tick.
pub fn tp_trigger(entry_price: Decimal, tp_pct: Decimal, tick: Decimal) -> Decimal {
    round_to_tick(
        entry_price * (Decimal::ONE - tp_pct / Decimal::ONE_HUNDRED),
        tick,
    )
}

/// SL trigger for a short: `entry × (1 + sl_pct/100)`, rounded to tick.
pub fn sl_trigger(entry_price: Decimal, sl_pct: Decimal, tick: Decimal) -> Decimal {
    round_to_tick(
        entry_price * (Decimal::ONE + sl_pct / Decimal::ONE_HUNDRED),
        tick,
    )
}

/// Realized PnL of a closed short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnlBreakdown {
    pub pnl_usdt: Decimal,
    pub pnl_pct: Decimal,
    pub fees_usdt: Decimal,
}

/// PnL for a short: `gross = (entry − exit) × qty`. Fees use the
/// venue-reported commission per leg when observed, otherwise
/// `notional × DEFAULT_FEE_RATE`. `pnl_pct` is relative to the committed
/// capital.
pub fn compute_pnl(
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    capital: Decimal,
    entry_commission: Option<Decimal>,
    exit_commission: Option<Decimal>,
) -> PnlBreakdown {
    let gross = (entry_price - exit_price) * quantity;
    let entry_fee =
        entry_commission.unwrap_or(entry_price * quantity * DEFAULT_FEE_RATE);
    let exit_fee = exit_commission.unwrap_or(exit_price * quantity * DEFAULT_FEE_RATE);
    let fees = entry_fee + exit_fee;
    let net = gross - fees;
    let pct = if capital > Decimal::ZERO {
        net / capital * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    };
    PnlBreakdown {
        pnl_usdt: net,
        pnl_pct: pct,
        fees_usdt: fees,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(0.1234), dec!(0.01)), dec!(0.12));
        assert_eq!(floor_to_step(dec!(0.1), dec!(0.01)), dec!(0.1));
        assert_eq!(floor_to_step(dec!(7.999), dec!(1)), dec!(7));
        assert_eq!(floor_to_step(dec!(5), Decimal::ZERO), dec!(5));
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(85.004), dec!(0.01)), dec!(85));
        assert_eq!(round_to_tick(dec!(85.006), dec!(0.01)), dec!(85.01));
        assert_eq!(round_to_tick(dec!(159.9999), dec!(0.0001)), dec!(159.9999));
    }

    #[test]
    fn test_entry_quantity() {
        // capital=10, leverage=1, price=100, step=0.01 -> 0.1
        assert_eq!(entry_quantity(dec!(10), 1, dec!(100), dec!(0.01)), dec!(0.1));
        // leverage scales the notional
        assert_eq!(entry_quantity(dec!(10), 5, dec!(100), dec!(0.01)), dec!(0.5));
        // rounding is downward
        assert_eq!(entry_quantity(dec!(10), 1, dec!(3), dec!(0.01)), dec!(3.33));
        assert_eq!(entry_quantity(dec!(10), 1, Decimal::ZERO, dec!(0.01)), Decimal::ZERO);
    }

    #[test]
    fn test_triggers_short() {
        // entry=100, tp=15% -> 85.00 ; sl=60% -> 160.00
        assert_eq!(tp_trigger(dec!(100.00), dec!(15), dec!(0.01)), dec!(85));
        assert_eq!(sl_trigger(dec!(100.00), dec!(60), dec!(0.01)), dec!(160));
    }

    #[test]
    fn test_pnl_tp_happy_path() {
        // Scenario: entry 100.00, exit 85.00, qty 0.1, capital 10
        let pnl = compute_pnl(dec!(100.00), dec!(85.00), dec!(0.1), dec!(10), None, None);
        assert_eq!(pnl.fees_usdt, dec!(0.0074));
        assert_eq!(pnl.pnl_usdt, dec!(1.4926));
        assert_eq!(pnl.pnl_pct, dec!(14.926));
    }

    #[test]
    fn test_pnl_sl_path() {
        // entry 100.00, exit 160.00, qty 0.1
        let pnl = compute_pnl(dec!(100.00), dec!(160.00), dec!(0.1), dec!(10), None, None);
        assert_eq!(pnl.fees_usdt, dec!(0.0104));
        assert_eq!(pnl.pnl_usdt, dec!(-6.0104));
    }

    #[test]
    fn test_pnl_prefers_reported_commissions() {
        let pnl = compute_pnl(
            dec!(100.00),
            dec!(85.00),
            dec!(0.1),
            dec!(10),
            Some(dec!(0.005)),
            Some(dec!(0.003)),
        );
        assert_eq!(pnl.fees_usdt, dec!(0.008));
        assert_eq!(pnl.pnl_usdt, dec!(1.492));
    }

    #[test]
    fn test_pnl_mixed_commission_fallback() {
        // Entry commission observed, exit leg estimated
        let pnl = compute_pnl(
            dec!(100.00),
            dec!(85.00),
            dec!(0.1),
            dec!(10),
            Some(dec!(0.005)),
            None,
        );
        assert_eq!(pnl.fees_usdt, dec!(0.005) + dec!(85.00) * dec!(0.1) * DEFAULT_FEE_RATE);
    }
}
