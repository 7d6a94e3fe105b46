//! Bank surface: deposits and withdrawals over the Lightning gateway,
//! balances, internal transfers and savings.

use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, PendingDeposit};
use axum::extract::{Path, Query, State};
use axum::Json;
use engine::lock;
use engine::nostr::feed;
use engine::nostr::NostrEvent;
use engine::EngineError;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Mirror the ledger to the relays as a kind 30078 statement.
pub fn publish_balance(state: &AppState, pubkey: &str) {
    let balance = state.bank.balance_msats(pubkey).unwrap_or(0);
    let savings = state.bank.savings_msats(pubkey).unwrap_or(0);
    let recent = state.bank.recent_transactions(pubkey, 10).unwrap_or_default();
    let event = feed::balance_event(
        state.signer.as_ref(),
        state.clock.now(),
        pubkey,
        balance,
        savings,
        &recent,
    );
    state.sink.publish(event);
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": state.clock.now(),
        "service": "bitcoin-perp-bank",
    }))
}

#[derive(Deserialize)]
pub struct ChallengeQuery {
    pubkey: String,
}

pub async fn challenge(
    State(state): State<AppState>,
    Query(q): Query<ChallengeQuery>,
) -> ApiResult<Json<Value>> {
    if !auth::valid_pubkey(&q.pubkey) {
        return Err(EngineError::Validation("invalid pubkey".into()).into());
    }
    let issued = auth::issue_challenge(&state.challenges, state.clock.now(), &q.pubkey);
    Ok(Json(json!({
        "challenge": issued.challenge,
        "expires_at": issued.expires_at,
    })))
}

pub async fn balance(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
) -> ApiResult<Json<Value>> {
    let balance = state.bank.balance_msats(&pubkey)?;
    let savings = state.bank.savings_msats(&pubkey)?;
    Ok(Json(json!({
        "pubkey": pubkey,
        "balance_msats": balance,
        "savings_msats": savings,
    })))
}

#[derive(Deserialize)]
pub struct TransactionsQuery {
    limit: Option<usize>,
}

pub async fn transactions(
    State(state): State<AppState>,
    Path(pubkey): Path<String>,
    Query(q): Query<TransactionsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let txns = state.bank.recent_transactions(&pubkey, limit)?;
    Ok(Json(json!({ "pubkey": pubkey, "transactions": txns })))
}

#[derive(Deserialize)]
pub struct DepositInvoiceReq {
    pubkey: String,
    amount_msats: i64,
}

pub async fn deposit_invoice(
    State(state): State<AppState>,
    Json(req): Json<DepositInvoiceReq>,
) -> ApiResult<Json<Value>> {
    if !auth::valid_pubkey(&req.pubkey) {
        return Err(EngineError::Validation("invalid pubkey".into()).into());
    }
    if req.amount_msats < state.config.min_deposit_msats
        || req.amount_msats > state.config.max_deposit_msats
    {
        return Err(EngineError::Validation(format!(
            "amount_msats must be within {}-{}",
            state.config.min_deposit_msats, state.config.max_deposit_msats
        ))
        .into());
    }
    let invoice = state
        .lightning
        .create_invoice(req.amount_msats, "bank deposit")?;
    lock(&state.pending_deposits, "pending_deposits").insert(
        invoice.payment_hash.clone(),
        PendingDeposit {
            pubkey: req.pubkey,
            amount_msats: req.amount_msats,
        },
    );
    Ok(Json(json!({
        "invoice": invoice.invoice,
        "payment_hash": invoice.payment_hash,
    })))
}

#[derive(Deserialize)]
pub struct WebhookReq {
    payment_hash: String,
}

fn settle_deposit(state: &AppState, payment_hash: &str) -> ApiResult<Option<Value>> {
    let pending = lock(&state.pending_deposits, "pending_deposits").remove(payment_hash);
    let Some(pending) = pending else {
        warn!(target = "bank", payment_hash, "webhook for unknown payment hash");
        return Ok(None);
    };
    let tx = state
        .bank
        .credit_deposit(&pending.pubkey, pending.amount_msats, Some(payment_hash))?;
    publish_balance(state, &pending.pubkey);
    info!(
        target = "bank",
        pubkey = %pending.pubkey,
        amount_msats = pending.amount_msats,
        tx_id = %tx.id,
        "deposit credited"
    );
    Ok(Some(json!({
        "pubkey": pending.pubkey,
        "balance_after_msats": tx.balance_after_msats,
    })))
}

pub async fn lightning_webhook(
    State(state): State<AppState>,
    Json(req): Json<WebhookReq>,
) -> ApiResult<Json<Value>> {
    match settle_deposit(&state, &req.payment_hash)? {
        Some(settled) => Ok(Json(json!({ "status": "ok", "settled": settled }))),
        None => Ok(Json(json!({ "status": "ignored" }))),
    }
}

/// Dev only: mark a mock invoice paid and credit the deposit.
pub async fn simulate_payment(
    State(state): State<AppState>,
    Json(req): Json<WebhookReq>,
) -> ApiResult<Json<Value>> {
    let mock = state
        .mock_lightning
        .as_ref()
        .ok_or_else(|| EngineError::Validation("only available with mock backend".into()))?;
    if !mock.simulate_payment(&req.payment_hash) {
        return Err(EngineError::NotFound("invoice").into());
    }
    match settle_deposit(&state, &req.payment_hash)? {
        Some(settled) => Ok(Json(json!({ "status": "ok", "settled": settled }))),
        None => Ok(Json(json!({ "status": "ignored" }))),
    }
}

#[derive(Deserialize)]
pub struct WithdrawReq {
    pubkey: String,
    invoice: String,
    amount_msats: i64,
    signed_challenge: Option<NostrEvent>,
}

pub async fn withdraw(
    State(state): State<AppState>,
    Json(req): Json<WithdrawReq>,
) -> ApiResult<Json<Value>> {
    if !auth::valid_pubkey(&req.pubkey) {
        return Err(EngineError::Validation("invalid pubkey".into()).into());
    }
    auth::consume_challenge(
        &state.challenges,
        state.clock.now(),
        &req.pubkey,
        req.signed_challenge.as_ref(),
    )?;
    if req.amount_msats <= 0 {
        return Err(EngineError::Validation("amount_msats must be positive".into()).into());
    }
    if state.bank.balance_msats(&req.pubkey)? < req.amount_msats {
        return Err(EngineError::InsufficientBalance.into());
    }
    let preimage = state.lightning.pay_invoice(&req.invoice).map_err(|e| {
        warn!(target = "bank", pubkey = %req.pubkey, error = %e, "withdrawal payment failed");
        ApiError(e)
    })?;
    let tx = state
        .bank
        .debit_withdrawal(&req.pubkey, req.amount_msats, Some(&req.invoice))?;
    publish_balance(&state, &req.pubkey);
    Ok(Json(json!({
        "preimage": preimage,
        "balance_after_msats": tx.balance_after_msats,
    })))
}

#[derive(Deserialize)]
pub struct SignedEventBody {
    pub signed_event: NostrEvent,
}

#[derive(Deserialize)]
struct TransferContent {
    to_pubkey: String,
    amount_msats: i64,
}

/// Internal transfer, authorized by a signed kind 33194 event whose content
/// is `{"to_pubkey", "amount_msats"}`. The event id doubles as the
/// idempotency key.
pub async fn transfer(
    State(state): State<AppState>,
    Json(body): Json<SignedEventBody>,
) -> ApiResult<Json<Value>> {
    let event = &body.signed_event;
    auth::verify_request_event(&state.processed_events, event, feed::KIND_TRANSFER)?;
    let content: TransferContent = serde_json::from_str(&event.content)
        .map_err(|_| EngineError::Validation("content must be {to_pubkey, amount_msats}".into()))?;
    if !auth::valid_pubkey(&content.to_pubkey) {
        return Err(EngineError::Validation("invalid to_pubkey".into()).into());
    }
    let outcome = state.bank.transfer_internal(
        &event.pubkey,
        &content.to_pubkey,
        content.amount_msats,
        &event.id,
    )?;
    auth::record_processed(&state.processed_events, &event.id);
    publish_balance(&state, &event.pubkey);
    publish_balance(&state, &content.to_pubkey);
    Ok(Json(json!({
        "from_pubkey": event.pubkey,
        "to_pubkey": content.to_pubkey,
        "amount_msats": content.amount_msats,
        "from_balance_after_msats": outcome.from_balance_after_msats,
        "to_balance_after_msats": outcome.to_balance_after_msats,
    })))
}

#[derive(Deserialize)]
pub struct SavingsReq {
    pubkey: String,
    amount_msats: i64,
    signed_challenge: Option<NostrEvent>,
}

async fn savings_move(state: AppState, req: SavingsReq, add: bool) -> ApiResult<Json<Value>> {
    auth::consume_challenge(
        &state.challenges,
        state.clock.now(),
        &req.pubkey,
        req.signed_challenge.as_ref(),
    )?;
    let (balance_after, savings_after) = if add {
        state.bank.savings_add(&req.pubkey, req.amount_msats)?
    } else {
        state.bank.savings_remove(&req.pubkey, req.amount_msats)?
    };
    publish_balance(&state, &req.pubkey);
    Ok(Json(json!({
        "balance_after_msats": balance_after,
        "savings_after_msats": savings_after,
    })))
}

pub async fn savings_add(
    State(state): State<AppState>,
    Json(req): Json<SavingsReq>,
) -> ApiResult<Json<Value>> {
    savings_move(state, req, true).await
}

pub async fn savings_remove(
    State(state): State<AppState>,
    Json(req): Json<SavingsReq>,
) -> ApiResult<Json<Value>> {
    savings_move(state, req, false).await
}
