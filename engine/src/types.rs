use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Side::Long),
            "short" => Ok(Side::Short),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(OrderType::Limit),
            "market" => Ok(OrderType::Market),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    /// Terminal orders can never fill or be cancelled again.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }

    /// Working orders rest on the book and remain cancellable.
    pub fn is_working(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A limit or market order. Money columns are integer millisatoshis; prices
/// are decimal USD.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub pubkey: String,
    pub market: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size_sats: i64,
    pub price_usd: Option<Decimal>,
    pub leverage: u32,
    pub status: OrderStatus,
    pub filled_size_sats: i64,
    /// Collateral debited when the order was accepted. Cancellation refunds
    /// are computed from this, pro rata on the unfilled remainder.
    pub reserved_msats: i64,
    pub nostr_event_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Order {
    pub fn remaining_sats(&self) -> i64 {
        self.size_sats - self.filled_size_sats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: String,
    pub pubkey: String,
    pub market: String,
    pub side: Side,
    pub size_sats: i64,
    pub entry_price_usd: Decimal,
    pub collateral_msats: i64,
    pub leverage: u32,
    /// Set once at entry; funding does not refresh it.
    pub liquidation_price_usd: Decimal,
    pub funding_cost_msats: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Immutable fill record. The buyer is always the long side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: String,
    pub market: String,
    pub buyer_pubkey: String,
    pub seller_pubkey: String,
    pub size_sats: i64,
    pub price_usd: Decimal,
    pub buy_order_id: String,
    pub sell_order_id: String,
    pub timestamp: u64,
}

/// Append-only funding record, one per (market, epoch).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FundingRate {
    pub id: i64,
    pub market: String,
    pub rate: Decimal,
    pub mark_price_usd: Decimal,
    pub index_price_usd: Decimal,
    /// Funding epoch: interval-aligned unix seconds.
    pub epoch: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FuturesAccount {
    pub pubkey: String,
    pub collateral_msats: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankAccount {
    pub pubkey: String,
    pub balance_msats: i64,
    pub savings_msats: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Journal row in the bank store. `amount_msats` is signed: debits are
/// negative, credits positive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankTransaction {
    pub id: String,
    pub pubkey: String,
    pub tx_type: String,
    pub amount_msats: i64,
    pub balance_after_msats: i64,
    pub invoice_id: Option<String>,
    pub counterparty_pubkey: Option<String>,
    pub created_at: u64,
}

/// Static parameters of a tradable market.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketParams {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub max_leverage: u32,
    pub initial_margin_pct: Decimal,
    pub maintenance_margin_pct: Decimal,
    pub maker_fee_pct: Decimal,
    pub taker_fee_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OracleData {
    pub market: String,
    pub index_price_usd: Option<Decimal>,
    pub mark_price_usd: Option<Decimal>,
    pub timestamp: u64,
}

/// OHLCV candle, bucketed by `floor(ts / bucket) * bucket`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub bucket: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume_sats: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_str() {
        assert_eq!("long".parse::<Side>().unwrap(), Side::Long);
        assert_eq!(Side::Short.as_str().parse::<Side>().unwrap(), Side::Short);
        assert!("buy".parse::<Side>().is_err());
    }

    #[test]
    fn status_terminality() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Open.is_working());
        assert!(OrderStatus::PartiallyFilled.is_working());
    }

    #[test]
    fn order_remaining() {
        let o = Order {
            id: "o1".into(),
            pubkey: "pk".into(),
            market: "BTC-USD-PERP".into(),
            side: Side::Long,
            order_type: OrderType::Limit,
            size_sats: 100_000,
            price_usd: Some(Decimal::new(50_000, 0)),
            leverage: 5,
            status: OrderStatus::PartiallyFilled,
            filled_size_sats: 40_000,
            reserved_msats: 20_050_000,
            nostr_event_id: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(o.remaining_sats(), 60_000);
    }
}
