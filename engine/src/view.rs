//! Read-only enrichment: live PnL and margin ratio on positions, market
//! stats and the aggregated order book for the public API.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::ledger::FuturesLedger;
use crate::oracle::PriceOracle;
use crate::risk;
use crate::types::{MarketParams, Order, OrderType, Position, Side};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub mark_price_usd: Decimal,
    pub unrealized_pnl_msats: i64,
    pub margin_ratio: Decimal,
    pub maintenance_margin_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BookLevel {
    pub price_usd: Decimal,
    pub size_sats: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderBookView {
    pub market: String,
    /// Bids: resting longs, best (highest) price first.
    pub bids: Vec<BookLevel>,
    /// Asks: resting shorts, best (lowest) price first.
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketStats {
    #[serde(flatten)]
    pub params: MarketParams,
    pub mark_price_usd: Option<Decimal>,
    pub index_price_usd: Option<Decimal>,
    pub funding_rate: Decimal,
    pub next_funding_in_seconds: u64,
    pub open_interest_sats: i64,
    pub change_24h_pct: Decimal,
}

pub struct Viewer {
    ledger: Arc<FuturesLedger>,
    oracle: Arc<PriceOracle>,
    clock: Arc<dyn Clock>,
    markets: HashMap<String, MarketParams>,
    funding_interval_seconds: u64,
}

impl Viewer {
    pub fn new(
        ledger: Arc<FuturesLedger>,
        oracle: Arc<PriceOracle>,
        clock: Arc<dyn Clock>,
        markets: HashMap<String, MarketParams>,
        funding_interval_seconds: u64,
    ) -> Self {
        Self {
            ledger,
            oracle,
            clock,
            markets,
            funding_interval_seconds,
        }
    }

    fn maintenance_margin(&self, market: &str) -> Decimal {
        self.markets
            .get(market)
            .map(|m| m.maintenance_margin_pct)
            .unwrap_or(Decimal::ZERO)
    }

    /// Enrich a position with live mark, PnL and margin ratio. When the
    /// oracle has nothing, the entry price stands in so the view stays
    /// renderable.
    pub async fn position_view(&self, position: &Position) -> PositionView {
        let mark = self
            .oracle
            .mark_price(&position.market)
            .await
            .unwrap_or(position.entry_price_usd);
        let pnl = risk::unrealized_pnl_msats(
            position.side,
            position.size_sats,
            position.entry_price_usd,
            mark,
        );
        let ratio = risk::margin_ratio(position.collateral_msats, pnl, position.size_sats);
        PositionView {
            position: position.clone(),
            mark_price_usd: mark,
            unrealized_pnl_msats: pnl,
            margin_ratio: ratio.round_dp(6),
            maintenance_margin_pct: self.maintenance_margin(&position.market),
        }
    }

    pub async fn positions_for_pubkey(&self, pubkey: &str) -> Result<Vec<PositionView>> {
        let positions = self.ledger.positions_for_pubkey(pubkey)?;
        let mut views = Vec::with_capacity(positions.len());
        for position in &positions {
            views.push(self.position_view(position).await);
        }
        Ok(views)
    }

    /// Aggregate resting limit orders into price levels.
    pub fn orderbook(&self, market: &str) -> Result<OrderBookView> {
        if !self.markets.contains_key(market) {
            return Err(EngineError::Validation(format!("unknown market: {market}")));
        }
        let open = self.ledger.open_orders_for_market(market, None)?;
        let mut bids = aggregate_levels(&open, Side::Long);
        let asks = aggregate_levels(&open, Side::Short);
        bids.reverse(); // best bid first
        Ok(OrderBookView {
            market: market.to_string(),
            bids,
            asks,
        })
    }

    pub async fn market_stats(&self, market: &str) -> Result<MarketStats> {
        let params = self
            .markets
            .get(market)
            .ok_or_else(|| EngineError::Validation(format!("unknown market: {market}")))?
            .clone();
        let data = self.oracle.oracle_data(market).await;
        let funding_rate = self
            .ledger
            .latest_funding_rate(market)?
            .map(|fr| fr.rate)
            .unwrap_or(Decimal::ZERO);
        let open_interest = self.ledger.total_open_interest_sats(market)?;
        let trades = self.ledger.recent_trades(market, 2)?;
        let change_24h_pct = match trades.as_slice() {
            [latest, earlier] if !earlier.price_usd.is_zero() => {
                ((latest.price_usd - earlier.price_usd) / earlier.price_usd
                    * Decimal::ONE_HUNDRED)
                    .round_dp(4)
            }
            _ => Decimal::ZERO,
        };
        let now = self.clock.now();
        let next_funding_in_seconds =
            (now / self.funding_interval_seconds + 1) * self.funding_interval_seconds - now;
        Ok(MarketStats {
            params,
            mark_price_usd: data.mark_price_usd,
            index_price_usd: data.index_price_usd,
            funding_rate,
            next_funding_in_seconds,
            open_interest_sats: open_interest,
            change_24h_pct,
        })
    }
}

fn aggregate_levels(orders: &[Order], side: Side) -> Vec<BookLevel> {
    // input arrives price-ascending from the ledger
    let mut levels: Vec<BookLevel> = Vec::new();
    for order in orders {
        if order.side != side || order.order_type != OrderType::Limit {
            continue;
        }
        let Some(price) = order.price_usd else {
            continue;
        };
        let remaining = order.remaining_sats();
        if remaining <= 0 {
            continue;
        }
        match levels.last_mut() {
            Some(level) if level.price_usd == price => level.size_sats += remaining,
            _ => levels.push(BookLevel {
                price_usd: price,
                size_sats: remaining,
            }),
        }
    }
    levels
}
