//! Lightning gateway abstraction. The bank only needs three operations:
//! mint an invoice for a deposit, learn that it was paid, and pay an
//! outbound invoice for a withdrawal. Real node backends implement this
//! trait; the mock keeps invoices in memory for development and tests.

use crate::error::{EngineError, Result};
use crate::lock;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub invoice: String,
    pub payment_hash: String,
    pub amount_msats: i64,
}

pub trait LightningGateway: Send + Sync {
    fn create_invoice(&self, amount_msats: i64, memo: &str) -> Result<Invoice>;
    fn invoice_paid(&self, payment_hash: &str) -> bool;
    /// Pay an invoice, returning the preimage.
    fn pay_invoice(&self, invoice: &str) -> Result<String>;
}

#[derive(Default)]
pub struct MockLightningGateway {
    invoices: Mutex<HashMap<String, Invoice>>,
    paid: Mutex<HashSet<String>>,
}

impl MockLightningGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an invoice as paid, as a webhook from a real backend would.
    pub fn simulate_payment(&self, payment_hash: &str) -> bool {
        let invoices = lock(&self.invoices, "ln_invoices");
        if !invoices.contains_key(payment_hash) {
            return false;
        }
        lock(&self.paid, "ln_paid").insert(payment_hash.to_string());
        true
    }
}

impl LightningGateway for MockLightningGateway {
    fn create_invoice(&self, amount_msats: i64, _memo: &str) -> Result<Invoice> {
        if amount_msats <= 0 {
            return Err(EngineError::Validation("amount_msats must be positive".into()));
        }
        let mut hash_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut hash_bytes);
        let payment_hash = hex::encode(hash_bytes);
        let invoice = Invoice {
            invoice: format!("lnbc{}n1mock-{}", amount_msats / 1000, &payment_hash[..16]),
            payment_hash: payment_hash.clone(),
            amount_msats,
        };
        lock(&self.invoices, "ln_invoices").insert(payment_hash, invoice.clone());
        Ok(invoice)
    }

    fn invoice_paid(&self, payment_hash: &str) -> bool {
        lock(&self.paid, "ln_paid").contains(payment_hash)
    }

    fn pay_invoice(&self, invoice: &str) -> Result<String> {
        let invoices = lock(&self.invoices, "ln_invoices");
        let found = invoices
            .values()
            .find(|i| i.invoice == invoice)
            .ok_or(EngineError::NotFound("invoice"))?;
        let payment_hash = found.payment_hash.clone();
        drop(invoices);
        lock(&self.paid, "ln_paid").insert(payment_hash.clone());
        Ok(format!("mock_preimage_{}", &payment_hash[..16]))
    }
}
