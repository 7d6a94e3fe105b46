//! Matching engine: order validation, margin reservation, price-time
//! priority matching, fill execution and position closure.
//!
//! A single process-wide mutex serializes place/cancel/close so no two
//! orders ever observe the same book state. The ledger keeps per-call
//! atomicity on its own; the lock exists for the read-modify-write
//! sequences that span multiple ledger calls. No I/O happens under the
//! lock: oracle prices are fetched before it and events are published
//! after it drops.

use crate::clock::Clock;
use crate::config::INSURANCE_FUND_FEE_PCT;
use crate::error::{EngineError, Result};
use crate::ledger::futures::{NewOrder, NewPosition, NewTrade};
use crate::ledger::FuturesLedger;
use crate::lock;
use crate::nostr::feed;
use crate::nostr::{EventSink, NostrEvent, Signer};
use crate::oracle::PriceOracle;
use crate::risk;
use crate::types::{MarketParams, Order, OrderStatus, OrderType, Side};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct MatchingEngine {
    ledger: Arc<FuturesLedger>,
    oracle: Arc<PriceOracle>,
    signer: Arc<dyn Signer>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    markets: HashMap<String, MarketParams>,
    engine_lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Fill {
    pub size_sats: i64,
    pub price_usd: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderOutcome {
    pub order: Order,
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseOutcome {
    pub position_id: String,
    pub pnl_msats: i64,
    pub settlement_msats: i64,
    pub mark_price_usd: Decimal,
    pub insurance_draw_msats: i64,
    pub fee_msats: i64,
}

impl MatchingEngine {
    pub fn new(
        ledger: Arc<FuturesLedger>,
        oracle: Arc<PriceOracle>,
        signer: Arc<dyn Signer>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        markets: HashMap<String, MarketParams>,
    ) -> Self {
        Self {
            ledger,
            oracle,
            signer,
            sink,
            clock,
            markets,
            engine_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn markets(&self) -> &HashMap<String, MarketParams> {
        &self.markets
    }

    pub fn market(&self, symbol: &str) -> Option<&MarketParams> {
        self.markets.get(symbol)
    }

    /// The background engines (funding, liquidation) run their
    /// read-modify-write passes under the same lock.
    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        self.engine_lock.clone()
    }

    /// Validate, reserve margin, persist and immediately match an order.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        pubkey: &str,
        market: &str,
        side: Side,
        order_type: OrderType,
        size_sats: i64,
        leverage: u32,
        price_usd: Option<Decimal>,
        nostr_event_id: Option<&str>,
    ) -> Result<PlaceOrderOutcome> {
        let params = self
            .markets
            .get(market)
            .ok_or_else(|| EngineError::Validation(format!("unknown market: {market}")))?
            .clone();
        if size_sats <= 0 {
            return Err(EngineError::Validation("size_sats must be positive".into()));
        }
        if leverage < 1 || leverage > params.max_leverage {
            return Err(EngineError::Validation(format!(
                "leverage must be 1-{}",
                params.max_leverage
            )));
        }
        let stored_price = match order_type {
            OrderType::Limit => match price_usd {
                Some(p) if p > Decimal::ZERO => Some(p),
                _ => {
                    return Err(EngineError::Validation(
                        "limit order requires price_usd > 0".into(),
                    ))
                }
            },
            OrderType::Market => None,
        };
        // Market orders price against the mark; fetched before the lock.
        let ref_price = match stored_price {
            Some(p) => p,
            None => self
                .oracle
                .mark_price(market)
                .await
                .ok_or(EngineError::OracleUnavailable)?,
        };

        let required = risk::required_collateral_msats(size_sats, leverage, params.taker_fee_pct);

        let mut events: Vec<NostrEvent> = Vec::new();
        let outcome = {
            let _guard = lock(&self.engine_lock, "engine");
            self.ledger.debit_collateral(pubkey, required)?;
            let order = self.ledger.create_order(NewOrder {
                pubkey,
                market,
                side,
                order_type,
                size_sats,
                price_usd: stored_price,
                leverage,
                reserved_msats: required,
                nostr_event_id,
            })?;
            let (order, fills) = self.match_order(order, ref_price, &params, &mut events)?;
            PlaceOrderOutcome { order, fills }
        };

        info!(
            target = "bank",
            order_id = %outcome.order.id,
            market,
            side = side.as_str(),
            order_type = order_type.as_str(),
            size_sats,
            fills = outcome.fills.len(),
            status = outcome.order.status.as_str(),
            "order placed"
        );
        // Traders who signed their own order get it relayed by the caller;
        // otherwise the bank publishes a signed summary.
        if outcome.order.nostr_event_id.is_none() {
            events.push(feed::order_event(
                self.signer.as_ref(),
                self.clock.now(),
                &outcome.order,
            ));
        }
        for event in events {
            self.sink.publish(event);
        }
        Ok(outcome)
    }

    /// One pass over the resting book. Price-time priority: candidates are
    /// opposite-side limit orders, best price first, oldest first within a
    /// price level; the maker always sets the fill price.
    fn match_order(
        &self,
        mut taker: Order,
        ref_price: Decimal,
        params: &MarketParams,
        events: &mut Vec<NostrEvent>,
    ) -> Result<(Order, Vec<Fill>)> {
        let mut candidates: Vec<Order> = self
            .ledger
            .open_orders_for_market(&taker.market, Some(taker.side.opposite()))?
            .into_iter()
            .filter(|o| o.order_type == OrderType::Limit && o.price_usd.is_some())
            .collect();
        // The ledger returns price-ascending; a short taker wants the
        // highest bid first.
        if taker.side == Side::Short {
            candidates.sort_by(|a, b| {
                b.price_usd
                    .cmp(&a.price_usd)
                    .then(a.created_at.cmp(&b.created_at))
            });
        }

        let taker_is_limit = taker.order_type == OrderType::Limit;
        let taker_price = taker.price_usd.unwrap_or(ref_price);
        let mut fills = Vec::new();

        for maker in candidates {
            if taker.remaining_sats() <= 0 {
                break;
            }
            let Some(maker_price) = maker.price_usd else {
                continue;
            };
            if taker_is_limit {
                let crossed = match taker.side {
                    Side::Long => taker_price >= maker_price,
                    Side::Short => taker_price <= maker_price,
                };
                if !crossed {
                    break;
                }
            }
            let fill_size = taker.remaining_sats().min(maker.remaining_sats());
            if fill_size <= 0 {
                continue;
            }
            self.execute_fill(&taker, &maker, fill_size, maker_price, params, events)?;
            taker.filled_size_sats += fill_size;
            fills.push(Fill {
                size_sats: fill_size,
                price_usd: maker_price,
            });
        }

        let taker = if taker.remaining_sats() == 0 {
            self.ledger
                .update_order_status(&taker.id, OrderStatus::Filled, Some(taker.filled_size_sats))?
        } else if taker.filled_size_sats > 0 {
            self.ledger.update_order_status(
                &taker.id,
                OrderStatus::PartiallyFilled,
                Some(taker.filled_size_sats),
            )?
        } else {
            taker
        };
        Ok((taker, fills))
    }

    /// One fill opens a position for each counterparty and records the
    /// immutable trade linking both orders.
    fn execute_fill(
        &self,
        taker: &Order,
        maker: &Order,
        fill_size_sats: i64,
        fill_price_usd: Decimal,
        params: &MarketParams,
        events: &mut Vec<NostrEvent>,
    ) -> Result<()> {
        let now = self.clock.now();
        for order in [taker, maker] {
            let liq_price = risk::liquidation_price(
                order.side,
                fill_price_usd,
                order.leverage,
                params.maintenance_margin_pct,
            );
            let fill_collateral = risk::fill_collateral_msats(
                order.reserved_msats,
                fill_size_sats,
                order.size_sats,
            );
            let position = self.ledger.create_position(NewPosition {
                pubkey: &order.pubkey,
                market: &order.market,
                side: order.side,
                size_sats: fill_size_sats,
                entry_price_usd: fill_price_usd,
                collateral_msats: fill_collateral,
                leverage: order.leverage,
                liquidation_price_usd: liq_price,
            })?;
            events.push(feed::position_event(self.signer.as_ref(), now, &position));
        }

        let new_filled = maker.filled_size_sats + fill_size_sats;
        let status = if new_filled >= maker.size_sats {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.ledger
            .update_order_status(&maker.id, status, Some(new_filled))?;

        let (buyer, seller) = match taker.side {
            Side::Long => (taker, maker),
            Side::Short => (maker, taker),
        };
        let trade = self.ledger.record_trade(NewTrade {
            market: &taker.market,
            buyer_pubkey: &buyer.pubkey,
            seller_pubkey: &seller.pubkey,
            size_sats: fill_size_sats,
            price_usd: fill_price_usd,
            buy_order_id: &buyer.id,
            sell_order_id: &seller.id,
        })?;
        events.push(feed::trade_event(self.signer.as_ref(), now, &trade));
        Ok(())
    }

    /// Cancel a working order and refund the reserved collateral covering
    /// the unfilled remainder.
    pub fn cancel_order(&self, pubkey: &str, order_id: &str) -> Result<Order> {
        let _guard = lock(&self.engine_lock, "engine");
        let order = self
            .ledger
            .order(order_id)?
            .ok_or(EngineError::NotFound("order"))?;
        if order.pubkey != pubkey {
            return Err(EngineError::Unauthorized("not your order".into()));
        }
        if order.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "order is {}, cannot cancel",
                order.status.as_str()
            )));
        }
        let refund =
            risk::fill_collateral_msats(order.reserved_msats, order.remaining_sats(), order.size_sats);
        let order = self
            .ledger
            .update_order_status(order_id, OrderStatus::Cancelled, None)?;
        if refund > 0 {
            self.ledger.credit_collateral(pubkey, refund)?;
        }
        info!(
            target = "bank",
            order_id,
            refund_msats = refund,
            "order cancelled"
        );
        Ok(order)
    }

    /// Close a position at the mark price. Losses beyond collateral draw on
    /// the insurance fund; a slice of profit feeds it.
    pub async fn close_position(&self, pubkey: &str, position_id: &str) -> Result<CloseOutcome> {
        let position = self
            .ledger
            .position(position_id)?
            .ok_or(EngineError::NotFound("position"))?;
        if position.pubkey != pubkey {
            return Err(EngineError::Unauthorized("not your position".into()));
        }
        let mark = self
            .oracle
            .mark_price(&position.market)
            .await
            .ok_or(EngineError::OracleUnavailable)?;

        let outcome = {
            let _guard = lock(&self.engine_lock, "engine");
            // Re-read: the position may have been liquidated while the
            // oracle call was in flight.
            let position = self
                .ledger
                .position(position_id)?
                .ok_or(EngineError::NotFound("position"))?;
            let pnl = risk::unrealized_pnl_msats(
                position.side,
                position.size_sats,
                position.entry_price_usd,
                mark,
            );
            let mut settlement = position.collateral_msats + pnl;
            let mut insurance_draw = 0;
            if settlement < 0 {
                insurance_draw = -settlement;
                self.ledger.debit_insurance_fund(insurance_draw)?;
                settlement = 0;
            }
            let mut fee = 0;
            if settlement > position.collateral_msats {
                fee = risk::fee_msats(
                    settlement - position.collateral_msats,
                    INSURANCE_FUND_FEE_PCT,
                );
                settlement -= fee;
                self.ledger.credit_insurance_fund(fee)?;
            }
            if !self.ledger.close_position(position_id)? {
                return Err(EngineError::NotFound("position"));
            }
            if settlement > 0 {
                self.ledger.credit_collateral(pubkey, settlement)?;
            }
            CloseOutcome {
                position_id: position_id.to_string(),
                pnl_msats: pnl,
                settlement_msats: settlement,
                mark_price_usd: mark,
                insurance_draw_msats: insurance_draw,
                fee_msats: fee,
            }
        };
        info!(
            target = "bank",
            position_id,
            pnl_msats = outcome.pnl_msats,
            settlement_msats = outcome.settlement_msats,
            "position closed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::nostr::{MemorySink, SchnorrSigner};
    use crate::oracle::StubFeed;
    use rust_decimal_macros::dec;

    const MARKET: &str = "BTC-USD-PERP";

    struct Harness {
        engine: MatchingEngine,
        ledger: Arc<FuturesLedger>,
        sink: Arc<MemorySink>,
        feed: Arc<StubFeed>,
        clock: Arc<ManualClock>,
    }

    fn harness(mark: Option<Decimal>) -> Harness {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let ledger = Arc::new(FuturesLedger::open_in_memory(clock.clone()).unwrap());
        let feed = Arc::new(StubFeed::new(mark));
        let oracle = Arc::new(PriceOracle::new(feed.clone(), clock.clone()));
        let sink = Arc::new(MemorySink::new());
        let signer = Arc::new(SchnorrSigner::generate());
        let engine = MatchingEngine::new(
            ledger.clone(),
            oracle,
            signer,
            sink.clone(),
            clock.clone(),
            Config::default().markets(),
        );
        Harness {
            engine,
            ledger,
            sink,
            feed,
            clock,
        }
    }

    fn fund(h: &Harness, pubkey: &str, msats: i64) {
        h.ledger.credit_collateral(pubkey, msats).unwrap();
    }

    #[tokio::test]
    async fn validation_rejections() {
        let h = harness(Some(dec!(50000)));
        let pk = "aa".repeat(32);
        let place = |market, side, ot, size, lev, price| {
            h.engine
                .place_order(&pk, market, side, ot, size, lev, price, None)
        };
        assert!(matches!(
            place("DOGE-PERP", Side::Long, OrderType::Limit, 1, 1, Some(dec!(1))).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            place(MARKET, Side::Long, OrderType::Limit, 0, 1, Some(dec!(1))).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            place(MARKET, Side::Long, OrderType::Limit, 1, 0, Some(dec!(1))).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            place(MARKET, Side::Long, OrderType::Limit, 1, 11, Some(dec!(1))).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            place(MARKET, Side::Long, OrderType::Limit, 1, 1, None).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            place(MARKET, Side::Long, OrderType::Limit, 1, 1, Some(dec!(-5))).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn market_order_without_oracle_fails() {
        let h = harness(None);
        let pk = "aa".repeat(32);
        fund(&h, &pk, 1_000_000_000);
        let err = h
            .engine
            .place_order(&pk, MARKET, Side::Long, OrderType::Market, 1_000, 2, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OracleUnavailable));
    }

    #[tokio::test]
    async fn insufficient_collateral_rejected() {
        let h = harness(Some(dec!(50000)));
        let pk = "aa".repeat(32);
        fund(&h, &pk, 1_000);
        let err = h
            .engine
            .place_order(
                &pk,
                MARKET,
                Side::Long,
                OrderType::Limit,
                100_000,
                5,
                Some(dec!(50000)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientCollateral { .. }));
        // nothing persisted
        assert!(h.ledger.open_orders_for_market(MARKET, None).unwrap().is_empty());
        assert_eq!(h.ledger.collateral_msats(&pk).unwrap(), 1_000);
    }

    #[tokio::test]
    async fn matched_limit_pair_creates_trade_and_positions() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 100_000_000);
        fund(&h, &b, 100_000_000);

        let resting = h
            .engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        assert_eq!(resting.order.status, OrderStatus::Open);
        assert!(resting.fills.is_empty());

        let taker = h
            .engine
            .place_order(&b, MARKET, Side::Short, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        assert_eq!(taker.order.status, OrderStatus::Filled);
        assert_eq!(taker.fills, vec![Fill { size_sats: 100_000, price_usd: dec!(50000) }]);

        let maker = h.ledger.order(&resting.order.id).unwrap().unwrap();
        assert_eq!(maker.status, OrderStatus::Filled);

        let trades = h.ledger.recent_trades(MARKET, 10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].buyer_pubkey, a);
        assert_eq!(trades[0].seller_pubkey, b);
        assert_eq!(trades[0].price_usd, dec!(50000));

        let long = h.ledger.positions_for_pubkey(&a).unwrap();
        let short = h.ledger.positions_for_pubkey(&b).unwrap();
        assert_eq!(long.len(), 1);
        assert_eq!(short.len(), 1);
        assert_eq!(long[0].size_sats, short[0].size_sats);
        assert_eq!(long[0].entry_price_usd, short[0].entry_price_usd);
        assert_eq!(long[0].liquidation_price_usd, dec!(42500));
        assert_eq!(short[0].liquidation_price_usd, dec!(57500));

        // 1050 trade, two 30052 positions, two 30051 order summaries
        let kinds = h.sink.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == 1050).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == 30052).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == 30051).count(), 2);
    }

    #[tokio::test]
    async fn price_time_priority_best_price_then_oldest() {
        let h = harness(Some(dec!(50000)));
        let bidder = "aa".repeat(32);
        let seller = "bb".repeat(32);
        fund(&h, &bidder, 1_000_000_000);
        fund(&h, &seller, 1_000_000_000);

        let b1 = h
            .engine
            .place_order(&bidder, MARKET, Side::Long, OrderType::Limit, 30_000, 5, Some(dec!(49990)), None)
            .await
            .unwrap();
        h.clock.advance(1);
        let b2 = h
            .engine
            .place_order(&bidder, MARKET, Side::Long, OrderType::Limit, 30_000, 5, Some(dec!(49990)), None)
            .await
            .unwrap();
        h.clock.advance(1);
        let b3 = h
            .engine
            .place_order(&bidder, MARKET, Side::Long, OrderType::Limit, 30_000, 5, Some(dec!(50010)), None)
            .await
            .unwrap();

        // market sell for 50_000: fills b3 fully (best price), then b1
        // (earliest at 49_990), never b2
        let sell = h
            .engine
            .place_order(&seller, MARKET, Side::Short, OrderType::Market, 50_000, 5, None, None)
            .await
            .unwrap();
        assert_eq!(sell.order.status, OrderStatus::Filled);
        assert_eq!(
            sell.fills,
            vec![
                Fill { size_sats: 30_000, price_usd: dec!(50010) },
                Fill { size_sats: 20_000, price_usd: dec!(49990) },
            ]
        );
        assert_eq!(h.ledger.order(&b3.order.id).unwrap().unwrap().status, OrderStatus::Filled);
        let b1 = h.ledger.order(&b1.order.id).unwrap().unwrap();
        assert_eq!(b1.status, OrderStatus::PartiallyFilled);
        assert_eq!(b1.filled_size_sats, 20_000);
        assert_eq!(h.ledger.order(&b2.order.id).unwrap().unwrap().filled_size_sats, 0);
    }

    #[tokio::test]
    async fn limit_taker_respects_price_gate() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 1_000_000_000);
        fund(&h, &b, 1_000_000_000);

        h.engine
            .place_order(&a, MARKET, Side::Short, OrderType::Limit, 10_000, 5, Some(dec!(50100)), None)
            .await
            .unwrap();
        // bid below the best ask rests instead of crossing
        let bid = h
            .engine
            .place_order(&b, MARKET, Side::Long, OrderType::Limit, 10_000, 5, Some(dec!(50050)), None)
            .await
            .unwrap();
        assert_eq!(bid.order.status, OrderStatus::Open);
        assert!(bid.fills.is_empty());
    }

    #[tokio::test]
    async fn partial_fill_leaves_remainder_on_book() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 1_000_000_000);
        fund(&h, &b, 1_000_000_000);

        h.engine
            .place_order(&a, MARKET, Side::Short, OrderType::Limit, 40_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        let taker = h
            .engine
            .place_order(&b, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        assert_eq!(taker.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(taker.order.filled_size_sats, 40_000);
        // the remainder still rests and matches a later ask
        let open = h.ledger.open_orders_for_market(MARKET, Some(Side::Long)).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].remaining_sats(), 60_000);
    }

    #[tokio::test]
    async fn cancel_refunds_reserved_collateral() {
        let h = harness(Some(dec!(50000)));
        let pk = "aa".repeat(32);
        fund(&h, &pk, 100_000_000);

        let placed = h
            .engine
            .place_order(&pk, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        // margin 20_000_000 + fee 50_000 reserved
        assert_eq!(h.ledger.collateral_msats(&pk).unwrap(), 100_000_000 - 20_050_000);

        let cancelled = h.engine.cancel_order(&pk, &placed.order.id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(h.ledger.collateral_msats(&pk).unwrap(), 100_000_000);
    }

    #[tokio::test]
    async fn cancel_rejects_wrong_owner_and_terminal() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 100_000_000);

        let placed = h
            .engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 10_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        assert!(matches!(
            h.engine.cancel_order(&b, &placed.order.id),
            Err(EngineError::Unauthorized(_))
        ));
        assert!(matches!(
            h.engine.cancel_order(&a, "missing"),
            Err(EngineError::NotFound("order"))
        ));
        h.engine.cancel_order(&a, &placed.order.id).unwrap();
        assert!(matches!(
            h.engine.cancel_order(&a, &placed.order.id),
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cancel_partially_filled_refunds_remainder_only() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 1_000_000_000);
        fund(&h, &b, 1_000_000_000);

        let bid = h
            .engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        h.engine
            .place_order(&b, MARKET, Side::Short, OrderType::Limit, 40_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();

        let before = h.ledger.collateral_msats(&a).unwrap();
        h.engine.cancel_order(&a, &bid.order.id).unwrap();
        let after = h.ledger.collateral_msats(&a).unwrap();
        // 60% of the reserved 20_050_000 comes back
        assert_eq!(after - before, 12_030_000);
    }

    #[tokio::test]
    async fn close_position_settles_pnl_and_profit_fee() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 100_000_000);
        fund(&h, &b, 100_000_000);

        h.engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        h.engine
            .place_order(&b, MARKET, Side::Short, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();

        // mark rises 2%: long pnl = +2_000_000 msats
        h.feed.set_price(Some(dec!(51000)));
        h.clock.advance(60);

        let pos = h.ledger.positions_for_pubkey(&a).unwrap().remove(0);
        let before = h.ledger.collateral_msats(&a).unwrap();
        let outcome = h.engine.close_position(&a, &pos.id).await.unwrap();
        assert_eq!(outcome.pnl_msats, 2_000_000);
        // 1% of profit to the insurance fund
        assert_eq!(outcome.fee_msats, 20_000);
        assert_eq!(outcome.settlement_msats, pos.collateral_msats + 2_000_000 - 20_000);
        assert_eq!(outcome.insurance_draw_msats, 0);
        assert_eq!(
            h.ledger.collateral_msats(&a).unwrap(),
            before + outcome.settlement_msats
        );
        assert_eq!(h.ledger.insurance_fund_msats().unwrap(), 20_000);
        assert!(h.ledger.position(&pos.id).unwrap().is_none());

        // closing again: gone
        assert!(matches!(
            h.engine.close_position(&a, &pos.id).await,
            Err(EngineError::NotFound("position"))
        ));
    }

    #[tokio::test]
    async fn close_underwater_position_draws_insurance() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 100_000_000);
        fund(&h, &b, 100_000_000);
        h.ledger.credit_insurance_fund(50_000_000).unwrap();

        h.engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        h.engine
            .place_order(&b, MARKET, Side::Short, OrderType::Limit, 100_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();

        // mark collapses 30%: long pnl = -30_000_000, collateral 20_050_000
        h.feed.set_price(Some(dec!(35000)));
        h.clock.advance(60);

        let pos = h.ledger.positions_for_pubkey(&a).unwrap().remove(0);
        let outcome = h.engine.close_position(&a, &pos.id).await.unwrap();
        assert_eq!(outcome.pnl_msats, -30_000_000);
        assert_eq!(outcome.settlement_msats, 0);
        assert_eq!(outcome.insurance_draw_msats, 30_000_000 - pos.collateral_msats);
        assert_eq!(
            h.ledger.insurance_fund_msats().unwrap(),
            50_000_000 - outcome.insurance_draw_msats
        );
    }

    #[tokio::test]
    async fn close_rejects_wrong_owner() {
        let h = harness(Some(dec!(50000)));
        let (a, b) = ("aa".repeat(32), "bb".repeat(32));
        fund(&h, &a, 100_000_000);
        fund(&h, &b, 100_000_000);
        h.engine
            .place_order(&a, MARKET, Side::Long, OrderType::Limit, 10_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        h.engine
            .place_order(&b, MARKET, Side::Short, OrderType::Limit, 10_000, 5, Some(dec!(50000)), None)
            .await
            .unwrap();
        let pos = h.ledger.positions_for_pubkey(&a).unwrap().remove(0);
        assert!(matches!(
            h.engine.close_position(&b, &pos.id).await,
            Err(EngineError::Unauthorized(_))
        ));
    }
}
