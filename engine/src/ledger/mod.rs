//! Persistent stores. Two SQLite files: the bank ledger (accounts,
//! transactions) and the futures ledger (collateral, orders, positions,
//! trades, funding, insurance fund). Every exposed operation is a single
//! transaction on a mutex-guarded connection.

pub mod bank;
pub mod futures;

pub use bank::BankLedger;
pub use futures::FuturesLedger;

use crate::error::Result;
use rusqlite::types::Type;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// Decimal columns are stored as TEXT so no precision is lost in SQLite.
pub(crate) fn parse_decimal(idx: usize, s: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parse_enum<T>(idx: usize, s: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    s.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Move bank balance into futures collateral. The two stores live in
/// separate database files, so this is two transactions; a failed credit
/// refunds the bank debit before surfacing the error.
pub fn move_bank_to_collateral(
    bank: &BankLedger,
    futures: &FuturesLedger,
    pubkey: &str,
    amount_msats: i64,
) -> Result<(i64, i64)> {
    let tx = bank.debit_for_futures(pubkey, amount_msats)?;
    match futures.credit_collateral(pubkey, amount_msats) {
        Ok(account) => Ok((tx.balance_after_msats, account.collateral_msats)),
        Err(e) => {
            warn!(
                target = "bank",
                pubkey = %pubkey,
                amount_msats,
                "collateral credit failed after bank debit, refunding"
            );
            let _ = bank.credit_from_futures(pubkey, amount_msats);
            Err(e)
        }
    }
}

/// Move futures collateral back to the bank balance.
pub fn move_collateral_to_bank(
    bank: &BankLedger,
    futures: &FuturesLedger,
    pubkey: &str,
    amount_msats: i64,
) -> Result<(i64, i64)> {
    let account = futures.debit_collateral(pubkey, amount_msats)?;
    match bank.credit_from_futures(pubkey, amount_msats) {
        Ok(tx) => Ok((tx.balance_after_msats, account.collateral_msats)),
        Err(e) => {
            warn!(
                target = "bank",
                pubkey = %pubkey,
                amount_msats,
                "bank credit failed after collateral debit, refunding"
            );
            let _ = futures.credit_collateral(pubkey, amount_msats);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::EngineError;
    use std::sync::Arc;

    fn stores() -> (BankLedger, FuturesLedger) {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        (
            BankLedger::open_in_memory(clock.clone()).unwrap(),
            FuturesLedger::open_in_memory(clock).unwrap(),
        )
    }

    #[test]
    fn deposit_then_withdraw_restores_bank_balance() {
        let (bank, futures) = stores();
        let pk = "aa".repeat(32);
        bank.credit_deposit(&pk, 10_000_000, Some("inv")).unwrap();

        let (bal, col) = move_bank_to_collateral(&bank, &futures, &pk, 4_000_000).unwrap();
        assert_eq!(bal, 6_000_000);
        assert_eq!(col, 4_000_000);

        let (bal, col) = move_collateral_to_bank(&bank, &futures, &pk, 4_000_000).unwrap();
        assert_eq!(bal, 10_000_000);
        assert_eq!(col, 0);
    }

    #[test]
    fn bridge_respects_funds_constraints() {
        let (bank, futures) = stores();
        let pk = "bb".repeat(32);
        bank.credit_deposit(&pk, 1_000, None).unwrap();
        assert!(matches!(
            move_bank_to_collateral(&bank, &futures, &pk, 2_000),
            Err(EngineError::InsufficientBalance)
        ));
        assert!(matches!(
            move_collateral_to_bank(&bank, &futures, &pk, 1),
            Err(EngineError::InsufficientCollateral { .. })
        ));
        // nothing moved
        assert_eq!(bank.balance_msats(&pk).unwrap(), 1_000);
        assert_eq!(futures.collateral_msats(&pk).unwrap(), 0);
    }
}
