use engine::clock::Clock;
use engine::config::Config;
use engine::ledger::{BankLedger, FuturesLedger};
use engine::lightning::{LightningGateway, MockLightningGateway};
use engine::matching::MatchingEngine;
use engine::nostr::{EventSink, Signer};
use engine::oracle::PriceOracle;
use engine::view::Viewer;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct Challenge {
    pub challenge: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct PendingDeposit {
    pub pubkey: String,
    pub amount_msats: i64,
}

/// Everything the handlers touch, built once at startup. Gathers what used
/// to be process-wide mutable state (challenge map, processed-event set,
/// pending deposits) behind one explicit handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub bank: Arc<BankLedger>,
    pub futures: Arc<FuturesLedger>,
    pub engine: Arc<MatchingEngine>,
    pub viewer: Arc<Viewer>,
    pub oracle: Arc<PriceOracle>,
    pub signer: Arc<dyn Signer>,
    pub sink: Arc<dyn EventSink>,
    pub lightning: Arc<dyn LightningGateway>,
    /// Set when running against the mock backend; enables the dev-only
    /// simulate-payment endpoint.
    pub mock_lightning: Option<Arc<MockLightningGateway>>,
    pub challenges: Arc<Mutex<HashMap<String, Challenge>>>,
    pub processed_events: Arc<Mutex<HashSet<String>>>,
    pub pending_deposits: Arc<Mutex<HashMap<String, PendingDeposit>>>,
}
