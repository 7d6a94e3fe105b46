//! Core of a custodial bitcoin bank with a perpetual-futures exchange on an
//! internal millisatoshi ledger: matching engine, position and collateral
//! ledger, funding and liquidation engines, price oracle and the signed
//! event feed.

pub mod clock;
pub mod config;
pub mod error;
pub mod funding;
pub mod ledger;
pub mod lightning;
pub mod liquidation;
pub mod matching;
pub mod nostr;
pub mod oracle;
pub mod risk;
pub mod types;
pub mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{EngineError, Result};
pub use types::*;

use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Take a mutex, recovering from poisoning instead of panicking the
/// process.
pub fn lock<'a, T>(m: &'a Mutex<T>, name: &str) -> MutexGuard<'a, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(target = "bank", "recovered from poisoned mutex: {}", name);
            poisoned.into_inner()
        }
    }
}
