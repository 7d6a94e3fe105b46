//! Event builders for the exchange feed.
//!
//! Kinds:
//!   30050 — market definition      (d = symbol, replaceable)
//!   30051 — order                  (d = order id; user-signed orders are
//!                                   relayed as-is, otherwise bank-signed)
//!   30052 — position state         (d = pubkey:market)
//!   30053 — funding rate update    (d = symbol)
//!   30054 — oracle price           (d = symbol)
//!   30078 — balance / statement    (d = bank/balance/<pubkey>)
//!   1050  — trade receipt          (immutable)
//!   1051  — liquidation notice     (immutable)
//!   1052  — order cancel request   (user-signed, never published)
//!   1053  — position close request (user-signed, never published)
//!   33194 — bank transfer request  (user-signed, never published)

use crate::nostr::event::NostrEvent;
use crate::nostr::signer::Signer;
use crate::types::{BankTransaction, FundingRate, MarketParams, Order, OracleData, Position, Trade};
use rust_decimal::Decimal;
use serde_json::json;

pub const KIND_MARKET: u32 = 30050;
pub const KIND_ORDER: u32 = 30051;
pub const KIND_POSITION: u32 = 30052;
pub const KIND_FUNDING: u32 = 30053;
pub const KIND_ORACLE: u32 = 30054;
pub const KIND_BALANCE: u32 = 30078;
pub const KIND_TRADE: u32 = 1050;
pub const KIND_LIQUIDATION: u32 = 1051;
pub const KIND_CANCEL_REQUEST: u32 = 1052;
pub const KIND_CLOSE_REQUEST: u32 = 1053;
pub const KIND_TRANSFER: u32 = 33194;

/// Market parameters, published so anyone can verify exchange rules.
pub fn market_definition_event(signer: &dyn Signer, now: u64, market: &MarketParams) -> NostrEvent {
    let tags = vec![
        vec!["d".into(), market.symbol.clone()],
        vec!["market".into(), market.symbol.clone()],
    ];
    let content = json!(market).to_string();
    signer.sign(KIND_MARKET, tags, content, now)
}

/// Bank-signed order summary, published when the trader did not submit a
/// signed event of their own.
pub fn order_event(signer: &dyn Signer, now: u64, order: &Order) -> NostrEvent {
    let mut tags = vec![
        vec!["d".into(), order.id.clone()],
        vec!["market".into(), order.market.clone()],
        vec!["side".into(), order.side.as_str().into()],
        vec!["type".into(), order.order_type.as_str().into()],
        vec!["status".into(), order.status.as_str().into()],
    ];
    if let Some(price) = order.price_usd {
        tags.push(vec!["price".into(), price.to_string()]);
    }
    let content = json!({
        "order_id": order.id,
        "pubkey": order.pubkey,
        "market": order.market,
        "side": order.side,
        "order_type": order.order_type,
        "size_sats": order.size_sats,
        "price_usd": order.price_usd,
        "leverage": order.leverage,
        "status": order.status,
        "created_at": order.created_at,
    })
    .to_string();
    signer.sign(KIND_ORDER, tags, content, now)
}

pub fn position_event(signer: &dyn Signer, now: u64, pos: &Position) -> NostrEvent {
    let tags = vec![
        vec!["d".into(), format!("{}:{}", pos.pubkey, pos.market)],
        vec!["market".into(), pos.market.clone()],
        vec!["side".into(), pos.side.as_str().into()],
        vec!["p".into(), pos.pubkey.clone()],
    ];
    let content = json!({
        "position_id": pos.id,
        "pubkey": pos.pubkey,
        "market": pos.market,
        "side": pos.side,
        "size_sats": pos.size_sats,
        "entry_price_usd": pos.entry_price_usd,
        "collateral_msats": pos.collateral_msats,
        "leverage": pos.leverage,
        "liquidation_price_usd": pos.liquidation_price_usd,
        "funding_cost_msats": pos.funding_cost_msats,
        "created_at": pos.created_at,
    })
    .to_string();
    signer.sign(KIND_POSITION, tags, content, now)
}

pub fn funding_rate_event(
    signer: &dyn Signer,
    now: u64,
    fr: &FundingRate,
    interval_hours: u64,
) -> NostrEvent {
    let tags = vec![
        vec!["d".into(), fr.market.clone()],
        vec!["market".into(), fr.market.clone()],
    ];
    let content = json!({
        "market": fr.market,
        "rate": fr.rate,
        "rate_pct": fr.rate * Decimal::ONE_HUNDRED,
        "mark_price_usd": fr.mark_price_usd,
        "index_price_usd": fr.index_price_usd,
        "timestamp": fr.timestamp,
        "interval_hours": interval_hours,
    })
    .to_string();
    signer.sign(KIND_FUNDING, tags, content, now)
}

pub fn oracle_event(signer: &dyn Signer, data: &OracleData) -> NostrEvent {
    let tags = vec![
        vec!["d".into(), data.market.clone()],
        vec!["market".into(), data.market.clone()],
    ];
    let content = json!(data).to_string();
    signer.sign(KIND_ORACLE, tags, content, data.timestamp)
}

pub fn trade_event(signer: &dyn Signer, now: u64, trade: &Trade) -> NostrEvent {
    let tags = vec![
        vec!["market".into(), trade.market.clone()],
        vec!["p".into(), trade.buyer_pubkey.clone()],
        vec!["p".into(), trade.seller_pubkey.clone()],
        vec!["buy_order".into(), trade.buy_order_id.clone()],
        vec!["sell_order".into(), trade.sell_order_id.clone()],
    ];
    let content = json!({
        "trade_id": trade.id,
        "market": trade.market,
        "price_usd": trade.price_usd,
        "size_sats": trade.size_sats,
        "buyer_pubkey": trade.buyer_pubkey,
        "seller_pubkey": trade.seller_pubkey,
        "timestamp": trade.timestamp,
    })
    .to_string();
    signer.sign(KIND_TRADE, tags, content, now)
}

pub fn liquidation_event(
    signer: &dyn Signer,
    now: u64,
    pos: &Position,
    mark_price_usd: Decimal,
    pnl_msats: i64,
    settlement_msats: i64,
) -> NostrEvent {
    let tags = vec![
        vec!["market".into(), pos.market.clone()],
        vec!["p".into(), pos.pubkey.clone()],
    ];
    let content = json!({
        "type": "liquidation",
        "position_id": pos.id,
        "pubkey": pos.pubkey,
        "market": pos.market,
        "side": pos.side,
        "size_sats": pos.size_sats,
        "entry_price_usd": pos.entry_price_usd,
        "mark_price_usd": mark_price_usd,
        "pnl_msats": pnl_msats,
        "settlement_msats": settlement_msats,
        "timestamp": now,
    })
    .to_string();
    signer.sign(KIND_LIQUIDATION, tags, content, now)
}

/// Replaceable balance statement mirroring the bank ledger.
pub fn balance_event(
    signer: &dyn Signer,
    now: u64,
    pubkey: &str,
    balance_msats: i64,
    savings_msats: i64,
    recent: &[BankTransaction],
) -> NostrEvent {
    let tags = vec![vec!["d".into(), format!("bank/balance/{pubkey}")]];
    let summary: Vec<_> = recent
        .iter()
        .take(10)
        .map(|t| {
            json!({
                "type": t.tx_type,
                "amount_msats": t.amount_msats,
                "created_at": t.created_at,
            })
        })
        .collect();
    let content = json!({
        "balance_msats": balance_msats,
        "savings_msats": savings_msats,
        "updated_at": now,
        "recent_transactions": summary,
    })
    .to_string();
    signer.sign(KIND_BALANCE, tags, content, now)
}
