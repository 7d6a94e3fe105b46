//! Funding scheduler.
//!
//! Every funding interval, per market:
//!   1. read (mark, index) from the oracle, skip the market when either is
//!      missing
//!   2. rate = clamp((mark - index) / index * FUNDING_FACTOR, ±MAX_RATE)
//!   3. positive rate: longs pay shorts; negative: shorts pay longs;
//!      payer collateral clamps at zero and is left for the next solvency
//!      scan
//!   4. append the funding_rates row and publish a kind 30053 event
//!
//! The pass is idempotent: the rate row is keyed (market, epoch) and each
//! position payment is keyed (position_id, epoch), so a crashed pass can be
//! re-run without settling anyone twice. A re-run settles with the recorded
//! epoch rate, not a fresh oracle read.

use crate::clock::Clock;
use crate::error::Result;
use crate::ledger::FuturesLedger;
use crate::lock;
use crate::nostr::feed;
use crate::nostr::{EventSink, Signer};
use crate::oracle::PriceOracle;
use crate::risk;
use crate::types::{FundingRate, MarketParams, Side};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct FundingScheduler {
    ledger: Arc<FuturesLedger>,
    oracle: Arc<PriceOracle>,
    signer: Arc<dyn Signer>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    markets: HashMap<String, MarketParams>,
    interval_seconds: u64,
    engine_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundingSummary {
    pub market: String,
    pub skipped: bool,
    pub rate: Decimal,
    pub epoch: u64,
    pub positions_processed: usize,
    pub total_debited_msats: i64,
    pub total_credited_msats: i64,
}

impl FundingSummary {
    fn skipped(market: &str, epoch: u64) -> Self {
        Self {
            market: market.to_string(),
            skipped: true,
            rate: Decimal::ZERO,
            epoch,
            positions_processed: 0,
            total_debited_msats: 0,
            total_credited_msats: 0,
        }
    }
}

impl FundingScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<FuturesLedger>,
        oracle: Arc<PriceOracle>,
        signer: Arc<dyn Signer>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        markets: HashMap<String, MarketParams>,
        interval_seconds: u64,
        engine_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            ledger,
            oracle,
            signer,
            sink,
            clock,
            markets,
            interval_seconds,
            engine_lock,
        }
    }

    /// Interval-aligned epoch id for a timestamp.
    pub fn epoch_for(&self, now: u64) -> u64 {
        now / self.interval_seconds * self.interval_seconds
    }

    pub fn seconds_until_next_epoch(&self, now: u64) -> u64 {
        (now / self.interval_seconds + 1) * self.interval_seconds - now
    }

    /// Settle one market for the current epoch.
    pub async fn settle_market(&self, market: &str) -> Result<FundingSummary> {
        let epoch = self.epoch_for(self.clock.now());
        let data = self.oracle.oracle_data(market).await;
        let (Some(mark), Some(index)) = (data.mark_price_usd, data.index_price_usd) else {
            warn!(target = "bank", market, "funding: oracle unavailable, skipping");
            return Ok(FundingSummary::skipped(market, epoch));
        };

        let mut debited: i64 = 0;
        let mut credited: i64 = 0;
        let (rate, new_record, positions_processed) = {
            let _guard = lock(&self.engine_lock, "engine");
            let new_record =
                self.ledger
                    .record_funding_rate(market, risk::funding_rate(mark, index), mark, index, epoch)?;
            // The recorded row is authoritative for this epoch, whether it
            // was written just now or by a pass that crashed mid-way.
            let rate = match &new_record {
                Some(fr) => fr.rate,
                None => self
                    .ledger
                    .funding_rate_for_epoch(market, epoch)?
                    .map(|fr| fr.rate)
                    .unwrap_or_else(|| risk::funding_rate(mark, index)),
            };

            let positions = self.ledger.open_positions(Some(market))?;
            for pos in &positions {
                let payment = risk::funding_payment_msats(rate, pos.size_sats);
                if payment == 0 {
                    continue;
                }
                let pays = match pos.side {
                    Side::Long => rate > Decimal::ZERO,
                    Side::Short => rate < Decimal::ZERO,
                };
                let (delta, new_collateral) = if pays {
                    (payment, (pos.collateral_msats - payment).max(0))
                } else {
                    (-payment, pos.collateral_msats + payment)
                };
                if self
                    .ledger
                    .apply_funding_payment(&pos.id, epoch, delta, new_collateral)?
                {
                    if pays {
                        debited += payment;
                    } else {
                        credited += payment;
                    }
                }
            }
            (rate, new_record, positions.len())
        };

        if let Some(fr) = &new_record {
            self.publish_rate(fr);
        }
        info!(
            target = "bank",
            market,
            %rate,
            %mark,
            %index,
            positions = positions_processed,
            debited_msats = debited,
            credited_msats = credited,
            "funding settled"
        );
        Ok(FundingSummary {
            market: market.to_string(),
            skipped: false,
            rate,
            epoch,
            positions_processed,
            total_debited_msats: debited,
            total_credited_msats: credited,
        })
    }

    fn publish_rate(&self, fr: &FundingRate) {
        let event = feed::funding_rate_event(
            self.signer.as_ref(),
            self.clock.now(),
            fr,
            self.interval_seconds / 3600,
        );
        self.sink.publish(event);
    }

    pub async fn run_once(&self) -> Vec<FundingSummary> {
        let mut summaries = Vec::new();
        for market in self.markets.keys() {
            match self.settle_market(market).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(target = "bank", market, error = %e, "funding pass failed"),
            }
        }
        summaries
    }

    /// Background loop, aligned to epoch boundaries.
    pub async fn run(self: Arc<Self>) {
        info!(
            target = "bank",
            interval_seconds = self.interval_seconds,
            "funding scheduler started"
        );
        loop {
            let wait = self.seconds_until_next_epoch(self.clock.now());
            tokio::time::sleep(Duration::from_secs(wait)).await;
            self.run_once().await;
        }
    }
}
