//! Liquidation engine: periodic solvency scan.
//!
//! A position whose margin ratio falls below maintenance is closed at the
//! mark price. The liquidation fee feeds the insurance fund; when equity
//! cannot cover the fee the fund takes whatever is left, and negative
//! equity is bad debt absorbed by the fund (saturating at zero).

use crate::clock::Clock;
use crate::config::LIQUIDATION_FEE_PCT;
use crate::error::Result;
use crate::ledger::FuturesLedger;
use crate::lock;
use crate::nostr::feed;
use crate::nostr::{EventSink, NostrEvent, Signer};
use crate::oracle::PriceOracle;
use crate::risk;
use crate::types::{MarketParams, Position};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

pub struct LiquidationEngine {
    ledger: Arc<FuturesLedger>,
    oracle: Arc<PriceOracle>,
    signer: Arc<dyn Signer>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    markets: HashMap<String, MarketParams>,
    scan_interval_seconds: u64,
    engine_lock: Arc<Mutex<()>>,
}

impl LiquidationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<FuturesLedger>,
        oracle: Arc<PriceOracle>,
        signer: Arc<dyn Signer>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        markets: HashMap<String, MarketParams>,
        scan_interval_seconds: u64,
        engine_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            ledger,
            oracle,
            signer,
            sink,
            clock,
            markets,
            scan_interval_seconds,
            engine_lock,
        }
    }

    /// Scan one market, liquidating every under-margined position. Returns
    /// the number liquidated. The oracle read happens before the engine
    /// lock; the whole mutation pass runs under it.
    pub async fn scan_market(&self, market: &str) -> Result<u32> {
        let Some(params) = self.markets.get(market) else {
            return Ok(0);
        };
        let Some(mark) = self.oracle.mark_price(market).await else {
            warn!(target = "bank", market, "liquidation: oracle unavailable, skipping");
            return Ok(0);
        };

        let mut events: Vec<NostrEvent> = Vec::new();
        let mut liquidated = 0u32;
        {
            let _guard = lock(&self.engine_lock, "engine");
            let positions = self.ledger.open_positions(Some(market))?;
            for pos in positions {
                match self.check_position(&pos, mark, params, &mut events) {
                    Ok(true) => liquidated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(target = "bank", position_id = %pos.id, error = %e, "liquidation check failed")
                    }
                }
            }
        }
        for event in events {
            self.sink.publish(event);
        }
        if liquidated > 0 {
            info!(target = "bank", market, liquidated, "liquidation scan done");
        }
        Ok(liquidated)
    }

    fn check_position(
        &self,
        pos: &Position,
        mark: Decimal,
        params: &MarketParams,
        events: &mut Vec<NostrEvent>,
    ) -> Result<bool> {
        let pnl = risk::unrealized_pnl_msats(pos.side, pos.size_sats, pos.entry_price_usd, mark);
        let ratio = risk::margin_ratio(pos.collateral_msats, pnl, pos.size_sats);
        if ratio >= params.maintenance_margin_pct {
            return Ok(false);
        }

        warn!(
            target = "bank",
            position_id = %pos.id,
            pubkey = %pos.pubkey,
            market = %pos.market,
            side = pos.side.as_str(),
            size_sats = pos.size_sats,
            %ratio,
            maintenance = %params.maintenance_margin_pct,
            %mark,
            "liquidating position"
        );

        let equity = pos.collateral_msats + pnl;
        let liq_fee = risk::fee_msats(risk::notional_msats(pos.size_sats), LIQUIDATION_FEE_PCT);
        let settlement_to_user = if equity >= liq_fee {
            self.ledger.credit_insurance_fund(liq_fee)?;
            equity - liq_fee
        } else if equity > 0 {
            self.ledger.credit_insurance_fund(equity)?;
            0
        } else {
            // bad debt: the fee is unrecoverable too
            self.ledger.debit_insurance_fund(-equity + liq_fee)?;
            0
        };

        if !self.ledger.close_position(&pos.id)? {
            warn!(target = "bank", position_id = %pos.id, "position vanished mid-liquidation");
            return Ok(false);
        }
        if settlement_to_user > 0 {
            self.ledger.credit_collateral(&pos.pubkey, settlement_to_user)?;
        }

        info!(
            target = "bank",
            position_id = %pos.id,
            pnl_msats = pnl,
            equity_msats = equity,
            settlement_msats = settlement_to_user,
            fee_msats = liq_fee,
            "position liquidated"
        );
        events.push(feed::liquidation_event(
            self.signer.as_ref(),
            self.clock.now(),
            pos,
            mark,
            pnl,
            settlement_to_user,
        ));
        Ok(true)
    }

    pub async fn run_once(&self) -> u32 {
        let mut total = 0;
        for market in self.markets.keys() {
            match self.scan_market(market).await {
                Ok(n) => total += n,
                Err(e) => error!(target = "bank", market, error = %e, "liquidation scan failed"),
            }
        }
        total
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            target = "bank",
            interval_seconds = self.scan_interval_seconds,
            "liquidation engine started"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.scan_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::ledger::futures::NewPosition;
    use crate::nostr::{MemorySink, SchnorrSigner};
    use crate::oracle::StubFeed;
    use crate::types::Side;
    use rust_decimal_macros::dec;

    const MARKET: &str = "BTC-USD-PERP";

    struct Harness {
        engine: LiquidationEngine,
        ledger: Arc<FuturesLedger>,
        sink: Arc<MemorySink>,
    }

    fn harness(mark: Option<Decimal>) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let ledger = Arc::new(FuturesLedger::open_in_memory(clock.clone()).unwrap());
        let feed = Arc::new(StubFeed::new(mark));
        let oracle = Arc::new(PriceOracle::new(feed, clock.clone()));
        let sink = Arc::new(MemorySink::new());
        let engine = LiquidationEngine::new(
            ledger.clone(),
            oracle,
            Arc::new(SchnorrSigner::generate()),
            sink.clone(),
            clock,
            Config::default().markets(),
            60,
            Arc::new(Mutex::new(())),
        );
        Harness { engine, ledger, sink }
    }

    fn open_position(h: &Harness, side: Side, size_sats: i64, collateral: i64, leverage: u32) -> Position {
        h.ledger
            .create_position(NewPosition {
                pubkey: &"aa".repeat(32),
                market: MARKET,
                side,
                size_sats,
                entry_price_usd: dec!(50000),
                collateral_msats: collateral,
                leverage,
                liquidation_price_usd: risk::liquidation_price(
                    side,
                    dec!(50000),
                    leverage,
                    dec!(0.05),
                ),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn healthy_position_survives_scan() {
        let h = harness(Some(dec!(50000)));
        let pos = open_position(&h, Side::Long, 100_000, 10_000_000, 10);
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 0);
        assert!(h.ledger.position(&pos.id).unwrap().is_some());
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn undermargined_long_is_liquidated_with_fee() {
        // 10x long at 50_000, collateral 10_000_000 msats, mark 47_000:
        // pnl = -6_000_000, ratio = 0.04 < 0.05
        let h = harness(Some(dec!(47000)));
        let pos = open_position(&h, Side::Long, 100_000, 10_000_000, 10);
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 1);

        assert!(h.ledger.position(&pos.id).unwrap().is_none());
        // fee = 0.5% of 100_000_000 = 500_000; user gets equity - fee
        assert_eq!(h.ledger.insurance_fund_msats().unwrap(), 500_000);
        assert_eq!(
            h.ledger.collateral_msats(&pos.pubkey).unwrap(),
            10_000_000 - 6_000_000 - 500_000
        );
        assert_eq!(h.sink.kinds(), vec![1051]);
    }

    #[tokio::test]
    async fn thin_equity_goes_entirely_to_insurance() {
        // equity positive but below the fee
        let h = harness(Some(dec!(47000)));
        open_position(&h, Side::Long, 100_000, 6_300_000, 10);
        // pnl -6_000_000, equity 300_000 < fee 500_000
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 1);
        assert_eq!(h.ledger.insurance_fund_msats().unwrap(), 300_000);
        assert_eq!(h.ledger.collateral_msats(&"aa".repeat(32)).unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_debt_draws_down_insurance_fund() {
        let h = harness(Some(dec!(40000)));
        h.ledger.credit_insurance_fund(20_000_000).unwrap();
        // pnl = -20_000_000, collateral 5_000_000: equity -15_000_000
        open_position(&h, Side::Long, 100_000, 5_000_000, 10);
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 1);
        // fund absorbs |equity| + fee = 15_500_000
        assert_eq!(h.ledger.insurance_fund_msats().unwrap(), 4_500_000);
    }

    #[tokio::test]
    async fn bad_debt_saturates_fund_at_zero() {
        let h = harness(Some(dec!(40000)));
        h.ledger.credit_insurance_fund(1_000).unwrap();
        open_position(&h, Side::Long, 100_000, 5_000_000, 10);
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 1);
        assert_eq!(h.ledger.insurance_fund_msats().unwrap(), 0);
    }

    #[tokio::test]
    async fn short_liquidates_when_mark_rises() {
        // 10x short at 50_000, liq price 47_500... for shorts the trigger is
        // a rising mark: liq = 50_000 * (1 + 0.1 - 0.05) = 52_500
        let h = harness(Some(dec!(53000)));
        let pos = open_position(&h, Side::Short, 100_000, 10_000_000, 10);
        assert_eq!(pos.liquidation_price_usd, dec!(52500));
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 1);
        assert!(h.ledger.position(&pos.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn oracle_outage_skips_scan() {
        let h = harness(None);
        let pos = open_position(&h, Side::Long, 100_000, 1, 10);
        assert_eq!(h.engine.scan_market(MARKET).await.unwrap(), 0);
        assert!(h.ledger.position(&pos.id).unwrap().is_some());
    }
}
