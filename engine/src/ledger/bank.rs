//! Bank ledger: authoritative store for account balances. The Nostr balance
//! events mirror this store for transparency, never the other way around.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::lock;
use crate::types::{BankAccount, BankTransaction};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

pub struct BankLedger {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub from_balance_after_msats: i64,
    pub to_balance_after_msats: i64,
}

impl BankLedger {
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Internal(format!("create db dir: {e}")))?;
        }
        let ledger = Self {
            conn: Mutex::new(Connection::open(path.as_ref())?),
            clock,
        };
        ledger.init_schema()?;
        info!(target = "bank", path = %path.as_ref().display(), "bank ledger opened");
        Ok(ledger)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            clock,
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock(&self.conn, "bank_db");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                pubkey TEXT PRIMARY KEY,
                balance_msats INTEGER NOT NULL DEFAULT 0,
                savings_msats INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                type TEXT NOT NULL,
                amount_msats INTEGER NOT NULL,
                balance_after_msats INTEGER NOT NULL,
                invoice_id TEXT,
                counterparty_pubkey TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tx_pubkey ON transactions(pubkey);
            CREATE INDEX IF NOT EXISTS idx_tx_created ON transactions(created_at);
            CREATE INDEX IF NOT EXISTS idx_tx_invoice ON transactions(invoice_id);

            CREATE TABLE IF NOT EXISTS nwc_connections (
                client_pubkey TEXT PRIMARY KEY,
                user_pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<BankAccount> {
        Ok(BankAccount {
            pubkey: row.get(0)?,
            balance_msats: row.get(1)?,
            savings_msats: row.get(2)?,
            created_at: row.get::<_, i64>(3)? as u64,
            updated_at: row.get::<_, i64>(4)? as u64,
        })
    }

    fn map_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<BankTransaction> {
        Ok(BankTransaction {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            tx_type: row.get(2)?,
            amount_msats: row.get(3)?,
            balance_after_msats: row.get(4)?,
            invoice_id: row.get(5)?,
            counterparty_pubkey: row.get(6)?,
            created_at: row.get::<_, i64>(7)? as u64,
        })
    }

    pub fn account(&self, pubkey: &str) -> Result<Option<BankAccount>> {
        let conn = lock(&self.conn, "bank_db");
        let account = conn
            .query_row(
                "SELECT pubkey, balance_msats, savings_msats, created_at, updated_at
                 FROM accounts WHERE pubkey = ?1",
                params![pubkey],
                Self::map_account,
            )
            .optional()?;
        Ok(account)
    }

    pub fn balance_msats(&self, pubkey: &str) -> Result<i64> {
        Ok(self.account(pubkey)?.map(|a| a.balance_msats).unwrap_or(0))
    }

    pub fn savings_msats(&self, pubkey: &str) -> Result<i64> {
        Ok(self.account(pubkey)?.map(|a| a.savings_msats).unwrap_or(0))
    }

    /// Sum of all spendable and savings balances; conservation checks.
    pub fn total_msats(&self) -> Result<i64> {
        let conn = lock(&self.conn, "bank_db");
        let total = conn.query_row(
            "SELECT COALESCE(SUM(balance_msats + savings_msats), 0) FROM accounts",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn credit(
        &self,
        pubkey: &str,
        amount_msats: i64,
        tx_type: &str,
        invoice_id: Option<&str>,
        counterparty: Option<&str>,
    ) -> Result<BankTransaction> {
        if amount_msats <= 0 {
            return Err(EngineError::Validation("amount_msats must be positive".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "bank_db");
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO accounts (pubkey, balance_msats, savings_msats, created_at, updated_at)
             VALUES (?1, 0, 0, ?2, ?2)",
            params![pubkey, now],
        )?;
        tx.execute(
            "UPDATE accounts SET balance_msats = balance_msats + ?1, updated_at = ?2 WHERE pubkey = ?3",
            params![amount_msats, now, pubkey],
        )?;
        let balance_after: i64 = tx.query_row(
            "SELECT balance_msats FROM accounts WHERE pubkey = ?1",
            params![pubkey],
            |row| row.get(0),
        )?;
        let record = BankTransaction {
            id: Uuid::new_v4().to_string(),
            pubkey: pubkey.to_string(),
            tx_type: tx_type.to_string(),
            amount_msats,
            balance_after_msats: balance_after,
            invoice_id: invoice_id.map(String::from),
            counterparty_pubkey: counterparty.map(String::from),
            created_at: now as u64,
        };
        Self::insert_transaction(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    fn debit(
        &self,
        pubkey: &str,
        amount_msats: i64,
        tx_type: &str,
        invoice_id: Option<&str>,
        counterparty: Option<&str>,
    ) -> Result<BankTransaction> {
        if amount_msats <= 0 {
            return Err(EngineError::Validation("amount_msats must be positive".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "bank_db");
        let tx = conn.unchecked_transaction()?;
        let balance: Option<i64> = tx
            .query_row(
                "SELECT balance_msats FROM accounts WHERE pubkey = ?1",
                params![pubkey],
                |row| row.get(0),
            )
            .optional()?;
        let balance = balance.ok_or(EngineError::InsufficientBalance)?;
        if balance < amount_msats {
            return Err(EngineError::InsufficientBalance);
        }
        tx.execute(
            "UPDATE accounts SET balance_msats = balance_msats - ?1, updated_at = ?2 WHERE pubkey = ?3",
            params![amount_msats, now, pubkey],
        )?;
        let record = BankTransaction {
            id: Uuid::new_v4().to_string(),
            pubkey: pubkey.to_string(),
            tx_type: tx_type.to_string(),
            amount_msats: -amount_msats,
            balance_after_msats: balance - amount_msats,
            invoice_id: invoice_id.map(String::from),
            counterparty_pubkey: counterparty.map(String::from),
            created_at: now as u64,
        };
        Self::insert_transaction(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    fn insert_transaction(tx: &rusqlite::Transaction<'_>, record: &BankTransaction) -> Result<()> {
        tx.execute(
            "INSERT INTO transactions
               (id, pubkey, type, amount_msats, balance_after_msats, invoice_id, counterparty_pubkey, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.pubkey,
                record.tx_type,
                record.amount_msats,
                record.balance_after_msats,
                record.invoice_id,
                record.counterparty_pubkey,
                record.created_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn credit_deposit(
        &self,
        pubkey: &str,
        amount_msats: i64,
        invoice_id: Option<&str>,
    ) -> Result<BankTransaction> {
        self.credit(pubkey, amount_msats, "deposit", invoice_id, None)
    }

    pub fn debit_withdrawal(
        &self,
        pubkey: &str,
        amount_msats: i64,
        invoice_id: Option<&str>,
    ) -> Result<BankTransaction> {
        self.debit(pubkey, amount_msats, "withdrawal", invoice_id, None)
    }

    /// Bank leg of a collateral deposit (bank -> futures).
    pub fn debit_for_futures(&self, pubkey: &str, amount_msats: i64) -> Result<BankTransaction> {
        self.debit(pubkey, amount_msats, "futures_deposit", None, None)
    }

    /// Bank leg of a collateral withdrawal (futures -> bank).
    pub fn credit_from_futures(&self, pubkey: &str, amount_msats: i64) -> Result<BankTransaction> {
        self.credit(pubkey, amount_msats, "futures_withdraw", None, None)
    }

    pub fn transfer_internal(
        &self,
        from_pubkey: &str,
        to_pubkey: &str,
        amount_msats: i64,
        transfer_id: &str,
    ) -> Result<TransferOutcome> {
        if from_pubkey == to_pubkey {
            return Err(EngineError::Validation("cannot transfer to self".into()));
        }
        if amount_msats <= 0 {
            return Err(EngineError::Validation("amount_msats must be positive".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "bank_db");
        let tx = conn.unchecked_transaction()?;
        let from_balance: Option<i64> = tx
            .query_row(
                "SELECT balance_msats FROM accounts WHERE pubkey = ?1",
                params![from_pubkey],
                |row| row.get(0),
            )
            .optional()?;
        let from_balance = from_balance.ok_or(EngineError::InsufficientBalance)?;
        if from_balance < amount_msats {
            return Err(EngineError::InsufficientBalance);
        }
        tx.execute(
            "UPDATE accounts SET balance_msats = balance_msats - ?1, updated_at = ?2 WHERE pubkey = ?3",
            params![amount_msats, now, from_pubkey],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO accounts (pubkey, balance_msats, savings_msats, created_at, updated_at)
             VALUES (?1, 0, 0, ?2, ?2)",
            params![to_pubkey, now],
        )?;
        tx.execute(
            "UPDATE accounts SET balance_msats = balance_msats + ?1, updated_at = ?2 WHERE pubkey = ?3",
            params![amount_msats, now, to_pubkey],
        )?;
        let to_balance: i64 = tx.query_row(
            "SELECT balance_msats FROM accounts WHERE pubkey = ?1",
            params![to_pubkey],
            |row| row.get(0),
        )?;
        let debit = BankTransaction {
            id: format!("{transfer_id}-debit"),
            pubkey: from_pubkey.to_string(),
            tx_type: "transfer_out".to_string(),
            amount_msats: -amount_msats,
            balance_after_msats: from_balance - amount_msats,
            invoice_id: None,
            counterparty_pubkey: Some(to_pubkey.to_string()),
            created_at: now as u64,
        };
        let credit = BankTransaction {
            id: format!("{transfer_id}-credit"),
            pubkey: to_pubkey.to_string(),
            tx_type: "transfer_in".to_string(),
            amount_msats,
            balance_after_msats: to_balance,
            invoice_id: None,
            counterparty_pubkey: Some(from_pubkey.to_string()),
            created_at: now as u64,
        };
        Self::insert_transaction(&tx, &debit)?;
        Self::insert_transaction(&tx, &credit)?;
        tx.commit()?;
        Ok(TransferOutcome {
            from_balance_after_msats: from_balance - amount_msats,
            to_balance_after_msats: to_balance,
        })
    }

    /// Move msats from spendable to savings. Returns (balance, savings) after.
    pub fn savings_add(&self, pubkey: &str, amount_msats: i64) -> Result<(i64, i64)> {
        self.savings_move(pubkey, amount_msats, true)
    }

    /// Move msats from savings back to spendable. Returns (balance, savings).
    pub fn savings_remove(&self, pubkey: &str, amount_msats: i64) -> Result<(i64, i64)> {
        self.savings_move(pubkey, amount_msats, false)
    }

    fn savings_move(&self, pubkey: &str, amount_msats: i64, into_savings: bool) -> Result<(i64, i64)> {
        if amount_msats <= 0 {
            return Err(EngineError::Validation("amount_msats must be positive".into()));
        }
        let now = self.clock.now() as i64;
        let conn = lock(&self.conn, "bank_db");
        let tx = conn.unchecked_transaction()?;
        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT balance_msats, savings_msats FROM accounts WHERE pubkey = ?1",
                params![pubkey],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (balance, savings) = row.ok_or(if into_savings {
            EngineError::InsufficientBalance
        } else {
            EngineError::InsufficientSavings
        })?;
        let (balance_after, savings_after) = if into_savings {
            if balance < amount_msats {
                return Err(EngineError::InsufficientBalance);
            }
            (balance - amount_msats, savings + amount_msats)
        } else {
            if savings < amount_msats {
                return Err(EngineError::InsufficientSavings);
            }
            (balance + amount_msats, savings - amount_msats)
        };
        tx.execute(
            "UPDATE accounts SET balance_msats = ?1, savings_msats = ?2, updated_at = ?3 WHERE pubkey = ?4",
            params![balance_after, savings_after, now, pubkey],
        )?;
        let record = BankTransaction {
            id: Uuid::new_v4().to_string(),
            pubkey: pubkey.to_string(),
            tx_type: if into_savings { "savings_add" } else { "savings_remove" }.to_string(),
            amount_msats: if into_savings { -amount_msats } else { amount_msats },
            balance_after_msats: balance_after,
            invoice_id: None,
            counterparty_pubkey: None,
            created_at: now as u64,
        };
        Self::insert_transaction(&tx, &record)?;
        tx.commit()?;
        Ok((balance_after, savings_after))
    }

    pub fn recent_transactions(&self, pubkey: &str, limit: usize) -> Result<Vec<BankTransaction>> {
        let conn = lock(&self.conn, "bank_db");
        let mut stmt = conn.prepare(
            "SELECT id, pubkey, type, amount_msats, balance_after_msats, invoice_id, counterparty_pubkey, created_at
             FROM transactions WHERE pubkey = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![pubkey, limit as i64], Self::map_transaction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn ledger() -> BankLedger {
        BankLedger::open_in_memory(Arc::new(ManualClock::new(1_700_000_000))).unwrap()
    }

    #[test]
    fn deposit_credits_and_journals() {
        let l = ledger();
        let pk = "aa".repeat(32);
        let tx = l.credit_deposit(&pk, 5_000, Some("inv-1")).unwrap();
        assert_eq!(tx.balance_after_msats, 5_000);
        assert_eq!(l.balance_msats(&pk).unwrap(), 5_000);
        let txns = l.recent_transactions(&pk, 10).unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].tx_type, "deposit");
        assert_eq!(txns[0].invoice_id.as_deref(), Some("inv-1"));
    }

    #[test]
    fn withdrawal_requires_funds() {
        let l = ledger();
        let pk = "aa".repeat(32);
        assert!(matches!(
            l.debit_withdrawal(&pk, 1, None),
            Err(EngineError::InsufficientBalance)
        ));
        l.credit_deposit(&pk, 5_000, None).unwrap();
        assert!(matches!(
            l.debit_withdrawal(&pk, 5_001, None),
            Err(EngineError::InsufficientBalance)
        ));
        let tx = l.debit_withdrawal(&pk, 3_000, None).unwrap();
        assert_eq!(tx.amount_msats, -3_000);
        assert_eq!(l.balance_msats(&pk).unwrap(), 2_000);
    }

    #[test]
    fn transfer_moves_funds_atomically() {
        let l = ledger();
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        l.credit_deposit(&a, 10_000, None).unwrap();
        let out = l.transfer_internal(&a, &b, 4_000, "ev-1").unwrap();
        assert_eq!(out.from_balance_after_msats, 6_000);
        assert_eq!(out.to_balance_after_msats, 4_000);
        assert_eq!(l.total_msats().unwrap(), 10_000);

        assert!(matches!(
            l.transfer_internal(&a, &a, 1, "ev-2"),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            l.transfer_internal(&b, &a, 4_001, "ev-3"),
            Err(EngineError::InsufficientBalance)
        ));
    }

    #[test]
    fn savings_round_trip() {
        let l = ledger();
        let pk = "cc".repeat(32);
        l.credit_deposit(&pk, 9_000, None).unwrap();
        let (bal, sav) = l.savings_add(&pk, 4_000).unwrap();
        assert_eq!((bal, sav), (5_000, 4_000));
        assert!(matches!(
            l.savings_remove(&pk, 4_001),
            Err(EngineError::InsufficientSavings)
        ));
        let (bal, sav) = l.savings_remove(&pk, 4_000).unwrap();
        assert_eq!((bal, sav), (9_000, 0));
        assert_eq!(l.total_msats().unwrap(), 9_000);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        let l = ledger();
        let pk = "dd".repeat(32);
        assert!(matches!(
            l.credit_deposit(&pk, 0, None),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            l.savings_add(&pk, -5),
            Err(EngineError::Validation(_))
        ));
    }
}
