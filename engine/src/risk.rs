//! Margin, PnL and funding math.
//!
//! All balance-bearing results are integer millisatoshis; decimal
//! intermediates are truncated toward zero before they touch a balance.

use crate::config::{FUNDING_FACTOR, MAX_FUNDING_RATE};
use crate::types::Side;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub fn sats_to_msats(sats: i64) -> i64 {
    sats * 1000
}

/// Notional value of a position in msats. Collateral is denominated in the
/// base asset, so notional reduces to size in msats regardless of price.
pub fn notional_msats(size_sats: i64) -> i64 {
    sats_to_msats(size_sats)
}

/// Truncate a decimal msat quantity toward zero, saturating on overflow.
fn dec_to_msats(d: Decimal) -> i64 {
    let t = d.trunc();
    t.to_i64().unwrap_or(if t.is_sign_negative() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Truncating percentage fee on an msat amount.
pub fn fee_msats(amount_msats: i64, fee_pct: Decimal) -> i64 {
    dec_to_msats(Decimal::from(amount_msats) * fee_pct)
}

/// Initial margin plus taker-fee buffer reserved when an order is accepted.
pub fn required_collateral_msats(size_sats: i64, leverage: u32, fee_pct: Decimal) -> i64 {
    let notional = notional_msats(size_sats);
    let margin = notional / i64::from(leverage.max(1));
    margin + fee_msats(notional, fee_pct)
}

/// Mark price at which equity hits maintenance margin, absent PnL changes.
///
/// `long:  entry * (1 - 1/leverage + mm)`
/// `short: entry * (1 + 1/leverage - mm)`
pub fn liquidation_price(side: Side, entry_price_usd: Decimal, leverage: u32, mm: Decimal) -> Decimal {
    let inv_lev = Decimal::ONE / Decimal::from(leverage.max(1));
    match side {
        Side::Long => entry_price_usd * (Decimal::ONE - inv_lev + mm),
        Side::Short => entry_price_usd * (Decimal::ONE + inv_lev - mm),
    }
}

pub fn unrealized_pnl_msats(
    side: Side,
    size_sats: i64,
    entry_price_usd: Decimal,
    mark_price_usd: Decimal,
) -> i64 {
    if entry_price_usd.is_zero() {
        return 0;
    }
    let pct = match side {
        Side::Long => (mark_price_usd - entry_price_usd) / entry_price_usd,
        Side::Short => (entry_price_usd - mark_price_usd) / entry_price_usd,
    };
    dec_to_msats(pct * Decimal::from(notional_msats(size_sats)))
}

/// `(collateral + unrealized_pnl) / notional`, dimensionless.
pub fn margin_ratio(collateral_msats: i64, unrealized_pnl_msats: i64, size_sats: i64) -> Decimal {
    let notional = notional_msats(size_sats);
    if notional <= 0 {
        return Decimal::ZERO;
    }
    Decimal::from(collateral_msats + unrealized_pnl_msats) / Decimal::from(notional)
}

/// `clamp((mark - index) / index * FUNDING_FACTOR, -MAX, MAX)`
pub fn funding_rate(mark_price_usd: Decimal, index_price_usd: Decimal) -> Decimal {
    if index_price_usd <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let premium = (mark_price_usd - index_price_usd) / index_price_usd;
    (premium * FUNDING_FACTOR).clamp(-MAX_FUNDING_RATE, MAX_FUNDING_RATE)
}

/// Per-position funding payment for one epoch, always non-negative; the
/// direction (who pays whom) is decided by the sign of the rate.
pub fn funding_payment_msats(rate: Decimal, size_sats: i64) -> i64 {
    dec_to_msats(rate.abs() * Decimal::from(notional_msats(size_sats)))
}

/// Pro-rata share of an order's reserved collateral covering `fill_sats`.
pub fn fill_collateral_msats(reserved_msats: i64, fill_sats: i64, size_sats: i64) -> i64 {
    if size_sats <= 0 {
        return 0;
    }
    dec_to_msats(Decimal::from(reserved_msats) * Decimal::from(fill_sats) / Decimal::from(size_sats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn required_collateral_margin_plus_fee() {
        // 100_000 sats at 5x: margin = 20_000_000 msats, fee = 0.05% of 1e8
        let required = required_collateral_msats(100_000, 5, dec!(0.0005));
        assert_eq!(required, 20_000_000 + 50_000);
    }

    #[test]
    fn liquidation_price_matches_formula() {
        // mm = 0.05, leverage 5: long 50_000 -> 42_500, short -> 57_500
        let long = liquidation_price(Side::Long, dec!(50000), 5, dec!(0.05));
        let short = liquidation_price(Side::Short, dec!(50000), 5, dec!(0.05));
        assert_eq!(long, dec!(42500));
        assert_eq!(short, dec!(57500));
    }

    #[test]
    fn liquidation_price_ten_x() {
        let long = liquidation_price(Side::Long, dec!(50000), 10, dec!(0.05));
        assert_eq!(long, dec!(47500));
    }

    #[test]
    fn pnl_long_gain_short_loss() {
        // 100_000 sats long from 50_000 to 55_000: +10% of 1e8 msats
        let pnl = unrealized_pnl_msats(Side::Long, 100_000, dec!(50000), dec!(55000));
        assert_eq!(pnl, 10_000_000);
        let pnl = unrealized_pnl_msats(Side::Short, 100_000, dec!(50000), dec!(55000));
        assert_eq!(pnl, -10_000_000);
    }

    #[test]
    fn pnl_truncates_toward_zero() {
        // 3 sats, 1% move: 0.01 * 3000 = 30 exactly; use an awkward move
        let pnl = unrealized_pnl_msats(Side::Long, 3, dec!(30000), dec!(30001));
        // (1/30000) * 3000 = 0.1 -> truncates to 0
        assert_eq!(pnl, 0);
        let pnl = unrealized_pnl_msats(Side::Short, 3, dec!(30000), dec!(30001));
        assert_eq!(pnl, 0);
    }

    #[test]
    fn margin_ratio_basics() {
        // collateral 20M, pnl -15M, notional 100M -> 0.05
        let mr = margin_ratio(20_000_000, -15_000_000, 100_000);
        assert_eq!(mr, dec!(0.05));
        assert_eq!(margin_ratio(1, 1, 0), Decimal::ZERO);
    }

    #[test]
    fn funding_rate_premium_and_clamp() {
        // mark 50_500, index 50_000: premium 0.01, rate 0.000003
        let r = funding_rate(dec!(50500), dec!(50000));
        assert_eq!(r, dec!(0.000003));
        // huge premium clamps
        let r = funding_rate(dec!(100000), dec!(1000));
        assert_eq!(r, MAX_FUNDING_RATE);
        let r = funding_rate(dec!(1000), dec!(100000));
        assert_eq!(r, -MAX_FUNDING_RATE);
        assert_eq!(funding_rate(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn funding_payment_scenario() {
        // 100_000_000 sats, rate 3e-6: payment = 3e-6 * 1e11 = 300_000 msats
        let rate = funding_rate(dec!(50500), dec!(50000));
        assert_eq!(funding_payment_msats(rate, 100_000_000), 300_000);
        // negative rate pays the same magnitude
        assert_eq!(funding_payment_msats(-rate, 100_000_000), 300_000);
    }

    #[test]
    fn fee_truncates_toward_zero() {
        // 0.5% of 100_000_000 msats
        assert_eq!(fee_msats(100_000_000, dec!(0.005)), 500_000);
        assert_eq!(fee_msats(999, dec!(0.0005)), 0);
        assert_eq!(fee_msats(-100_000_000, dec!(0.005)), -500_000);
    }

    #[test]
    fn fill_collateral_pro_rata() {
        assert_eq!(fill_collateral_msats(20_050_000, 50_000, 100_000), 10_025_000);
        assert_eq!(fill_collateral_msats(100, 1, 3), 33);
        assert_eq!(fill_collateral_msats(100, 1, 0), 0);
    }
}
