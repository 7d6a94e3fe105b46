//! Futures surface: market data reads and the signed write endpoints that
//! feed the matching engine.

use crate::auth;
use crate::error::ApiResult;
use crate::routes_bank::{publish_balance, SignedEventBody};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use engine::ledger::{move_bank_to_collateral, move_collateral_to_bank};
use engine::nostr::feed;
use engine::nostr::NostrEvent;
use engine::types::{OrderStatus, OrderType, Side};
use engine::EngineError;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn markets(State(state): State<AppState>) -> Json<Value> {
    let mut list: Vec<_> = state.engine.markets().values().cloned().collect();
    list.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    Json(json!({ "markets": list }))
}

pub async fn market_stats(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<Value>> {
    let stats = state.viewer.market_stats(&symbol).await?;
    Ok(Json(json!(stats)))
}

pub async fn orderbook(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<Value>> {
    let book = state.viewer.orderbook(&symbol)?;
    Ok(Json(json!(book)))
}

pub async fn collateral(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
) -> ApiResult<Json<Value>> {
    let collateral = state.futures.collateral_msats(&pubkey)?;
    Ok(Json(json!({
        "pubkey": pubkey,
        "collateral_msats": collateral,
    })))
}

#[derive(Deserialize)]
pub struct OrdersQuery {
    status: Option<String>,
}

pub async fn orders(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
    Query(q): Query<OrdersQuery>,
) -> ApiResult<Json<Value>> {
    let status = match q.status.as_deref() {
        Some(s) => Some(
            s.parse::<OrderStatus>()
                .map_err(EngineError::Validation)?,
        ),
        None => None,
    };
    let orders = state.futures.orders_for_pubkey(&pubkey, status, 50)?;
    Ok(Json(json!({ "pubkey": pubkey, "orders": orders })))
}

pub async fn positions(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
) -> ApiResult<Json<Value>> {
    let positions = state.viewer.positions_for_pubkey(&pubkey).await?;
    Ok(Json(json!({ "pubkey": pubkey, "positions": positions })))
}

#[derive(Deserialize)]
pub struct TradesQuery {
    limit: Option<usize>,
}

pub async fn trades(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let trades = state.futures.recent_trades(&symbol, limit)?;
    Ok(Json(json!({ "market": symbol, "trades": trades })))
}

/// Fills where the pubkey was on either side.
pub async fn fills(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let trades = state.futures.trades_for_pubkey(&pubkey, limit)?;
    Ok(Json(json!({ "pubkey": pubkey, "trades": trades })))
}

#[derive(Deserialize)]
pub struct FundingQuery {
    limit: Option<usize>,
}

pub async fn funding(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<FundingQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(48).clamp(1, 500);
    let latest = state.futures.latest_funding_rate(&symbol)?;
    let history = state.futures.funding_rate_history(&symbol, limit)?;
    Ok(Json(json!({
        "market": symbol,
        "latest": latest,
        "history": history,
    })))
}

#[derive(Deserialize)]
pub struct OhlcvQuery {
    since: Option<u64>,
    bucket: Option<u64>,
}

pub async fn ohlcv(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(q): Query<OhlcvQuery>,
) -> ApiResult<Json<Value>> {
    let candles = state
        .futures
        .ohlcv(&symbol, q.since.unwrap_or(0), q.bucket.unwrap_or(300))?;
    Ok(Json(json!({ "market": symbol, "candles": candles })))
}

#[derive(Deserialize)]
pub struct CollateralMoveReq {
    pubkey: String,
    amount_msats: i64,
    signed_challenge: Option<NostrEvent>,
}

fn authorize_collateral_move(state: &AppState, req: &CollateralMoveReq) -> Result<(), EngineError> {
    if !auth::valid_pubkey(&req.pubkey) {
        return Err(EngineError::Validation("invalid pubkey".into()));
    }
    if req.amount_msats <= 0 {
        return Err(EngineError::Validation("amount_msats must be positive".into()));
    }
    auth::consume_challenge(
        &state.challenges,
        state.clock.now(),
        &req.pubkey,
        req.signed_challenge.as_ref(),
    )
}

/// Move msats from the bank balance into futures collateral.
pub async fn deposit_collateral(
    State(state): State<AppState>,
    Json(req): Json<CollateralMoveReq>,
) -> ApiResult<Json<Value>> {
    authorize_collateral_move(&state, &req)?;
    let (balance, collateral) =
        move_bank_to_collateral(&state.bank, &state.futures, &req.pubkey, req.amount_msats)?;
    publish_balance(&state, &req.pubkey);
    Ok(Json(json!({
        "pubkey": req.pubkey,
        "balance_msats": balance,
        "collateral_msats": collateral,
    })))
}

pub async fn withdraw_collateral(
    State(state): State<AppState>,
    Json(req): Json<CollateralMoveReq>,
) -> ApiResult<Json<Value>> {
    authorize_collateral_move(&state, &req)?;
    let (balance, collateral) =
        move_collateral_to_bank(&state.bank, &state.futures, &req.pubkey, req.amount_msats)?;
    publish_balance(&state, &req.pubkey);
    Ok(Json(json!({
        "pubkey": req.pubkey,
        "balance_msats": balance,
        "collateral_msats": collateral,
    })))
}

#[derive(Deserialize)]
struct OrderContent {
    market: String,
    side: Side,
    order_type: OrderType,
    size_sats: i64,
    price_usd: Option<Decimal>,
    leverage: u32,
}

/// Place an order from a signed kind 30051 event whose content encodes the
/// order parameters. The signed event is relayed as-is afterwards.
pub async fn place_order(
    State(state): State<AppState>,
    Json(body): Json<SignedEventBody>,
) -> ApiResult<Json<Value>> {
    let event = &body.signed_event;
    auth::verify_request_event(&state.processed_events, event, feed::KIND_ORDER)?;
    let content: OrderContent = serde_json::from_str(&event.content).map_err(|e| {
        EngineError::Validation(format!("invalid order content: {e}"))
    })?;
    let outcome = state
        .engine
        .place_order(
            &event.pubkey,
            &content.market,
            content.side,
            content.order_type,
            content.size_sats,
            content.leverage,
            content.price_usd,
            Some(&event.id),
        )
        .await?;
    auth::record_processed(&state.processed_events, &event.id);
    state.sink.publish(event.clone());
    Ok(Json(json!({
        "order": outcome.order,
        "fills": outcome.fills,
    })))
}

#[derive(Deserialize)]
struct CancelContent {
    order_id: String,
}

/// Cancel an order; the body carries a signed kind 1052 event whose content
/// names the same order id as the path.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(body): Json<SignedEventBody>,
) -> ApiResult<Json<Value>> {
    let event = &body.signed_event;
    auth::verify_request_event(&state.processed_events, event, feed::KIND_CANCEL_REQUEST)?;
    let content: CancelContent = serde_json::from_str(&event.content)
        .map_err(|_| EngineError::Validation("content must be {order_id}".into()))?;
    if content.order_id != order_id {
        return Err(EngineError::Validation("order_id mismatch".into()).into());
    }
    let order = state.engine.cancel_order(&event.pubkey, &order_id)?;
    auth::record_processed(&state.processed_events, &event.id);
    Ok(Json(json!({ "order": order })))
}

#[derive(Deserialize)]
pub struct ClosePositionReq {
    position_id: String,
    signed_event: NostrEvent,
}

#[derive(Deserialize)]
struct CloseContent {
    position_id: String,
}

/// Close a position at the mark; authorized by a signed kind 1053 event
/// whose content names the same position id as the request.
pub async fn close_position(
    State(state): State<AppState>,
    Json(req): Json<ClosePositionReq>,
) -> ApiResult<Json<Value>> {
    let event = &req.signed_event;
    auth::verify_request_event(&state.processed_events, event, feed::KIND_CLOSE_REQUEST)?;
    let content: CloseContent = serde_json::from_str(&event.content)
        .map_err(|_| EngineError::Validation("content must be {position_id}".into()))?;
    if content.position_id != req.position_id {
        return Err(EngineError::Validation("position_id mismatch".into()).into());
    }
    let outcome = state
        .engine
        .close_position(&event.pubkey, &req.position_id)
        .await?;
    auth::record_processed(&state.processed_events, &event.id);
    Ok(Json(json!(outcome)))
}
