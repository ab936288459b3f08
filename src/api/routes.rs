//! HTTP surface.
//!
//! Player endpoints are called by the Telegram mini-app and the user bot
//! (authentication happens upstream of this service). Operator endpoints
//! carry the admin token and expose the ledger snapshot, recalculation
//! and reconciliation triggers, reconciliation history and withdrawal
//! approval. The gateway webhook drives deposit confirmation.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::casino::db::CasinoDb;
use crate::casino::deposits::{DepositError, DepositService};
use crate::casino::duels::{DuelError, DuelService};
use crate::casino::events::{EventBetError, EventBetService};
use crate::casino::fair::FairRoller;
use crate::casino::games::{GameError, GameService};
use crate::casino::promos::{PromoError, PromoService};
use crate::casino::treasury::{TreasuryError, TreasuryService};
use crate::casino::withdrawals::{WithdrawalError, WithdrawalService};
use crate::ledger::amount::{from_amount, to_amount};
use crate::ledger::operations::LedgerService;
use crate::ledger::recalc::RecalcEngine;
use crate::ledger::state::GameKind;
use crate::reconcile::ReconcileEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: CasinoDb,
    pub ledger: Arc<LedgerService>,
    pub recalc: Arc<RecalcEngine>,
    pub reconcile: Arc<ReconcileEngine>,
    pub games: Arc<GameService>,
    pub duels: Arc<DuelService>,
    pub events: Arc<EventBetService>,
    pub deposits: Arc<DepositService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub promos: Arc<PromoService>,
    pub treasury: Arc<TreasuryService>,
    pub fair: Arc<FairRoller>,
    pub admin_token: Arc<String>,
    pub max_state_age: chrono::Duration,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Player surface
        .route("/api/users/:id", get(get_user))
        .route("/api/games/play", post(play_game))
        .route("/api/duels", post(create_duel))
        .route("/api/duels/:id/join", post(join_duel))
        .route("/api/duels/:id/cancel", post(cancel_duel))
        .route("/api/events/bets", post(place_event_bet))
        .route("/api/deposits", post(create_deposit))
        .route("/api/deposits/:invoice_id", get(deposit_status))
        .route("/api/withdrawals", post(request_withdrawal))
        .route("/api/withdrawals/:id/cancel", post(cancel_withdrawal))
        .route("/api/promos/redeem", post(redeem_promo))
        .route("/api/referrals/claim", post(claim_referral))
        .route("/api/fair/commitment", get(fair_commitment))
        // Gateway webhook
        .route("/webhook/cryptopay", post(cryptopay_webhook))
        // Operator surface
        .route("/api/admin/ledger", get(ledger_snapshot))
        .route("/api/admin/ledger/history", get(ledger_history))
        .route("/api/admin/ledger/recalculate", post(recalculate_now))
        .route("/api/admin/reconcile", post(reconcile_now))
        .route("/api/admin/reconcile/history", get(reconcile_history))
        .route("/api/admin/withdrawals/:id/approve", post(approve_withdrawal))
        .route("/api/admin/withdrawals/:id/reject", post(reject_withdrawal))
        .route("/api/admin/events/bets/:id/settle", post(settle_event_bet))
        .route("/api/admin/events/bets/:id/refund", post(refund_event_bet))
        .route("/api/admin/promos", post(create_promo))
        .route("/api/admin/treasury/withdraw", post(owner_withdraw))
        .route("/api/admin/fair/rotate", post(rotate_fair_seed))
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = state
        .db
        .get_user(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("User {} not found", id)))?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "balance": from_amount(user.balance),
        "referral_balance": from_amount(user.referral_balance),
        "is_blocked": user.is_blocked,
    })))
}

#[derive(Deserialize)]
struct PlayRequest {
    user_id: i64,
    game: String,
    amount: f64,
    #[serde(default)]
    client_seed: String,
}

async fn play_game(
    State(state): State<AppState>,
    Json(req): Json<PlayRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let kind = GameKind::parse(&req.game)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown game: {}", req.game)))?;
    let outcome = state
        .games
        .play(req.user_id, kind, to_amount(req.amount), &req.client_seed)
        .await?;
    Ok(Json(json!({
        "game_id": outcome.game_id,
        "won": outcome.won,
        "payout": from_amount(outcome.payout),
        "roll": outcome.roll,
        "server_seed_hash": outcome.server_seed_hash,
        "nonce": outcome.nonce,
    })))
}

#[derive(Deserialize)]
struct CreateDuelRequest {
    user_id: i64,
    stake: f64,
}

async fn create_duel(
    State(state): State<AppState>,
    Json(req): Json<CreateDuelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let duel = state
        .duels
        .create(req.user_id, to_amount(req.stake))
        .await?;
    Ok(Json(json!({ "duel_id": duel.id, "stake": from_amount(duel.stake) })))
}

#[derive(Deserialize)]
struct UserAction {
    user_id: i64,
    #[serde(default)]
    reason: String,
}

async fn join_duel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UserAction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.duels.join_and_settle(&id, req.user_id).await?;
    Ok(Json(json!({
        "duel_id": result.duel.id,
        "winner_id": result.winner_id,
        "payout": from_amount(result.payout),
        "commission": from_amount(result.commission),
        "roll": result.roll,
    })))
}

async fn cancel_duel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UserAction>,
) -> Result<StatusCode, ApiError> {
    state.duels.cancel(&id, req.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct EventBetRequest {
    user_id: i64,
    event_id: String,
    selection: String,
    stake: f64,
}

async fn place_event_bet(
    State(state): State<AppState>,
    Json(req): Json<EventBetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bet = state
        .events
        .place(req.user_id, &req.event_id, &req.selection, to_amount(req.stake))
        .await?;
    Ok(Json(json!({ "bet_id": bet.id, "stake": from_amount(bet.stake) })))
}

#[derive(Deserialize)]
struct DepositRequest {
    user_id: i64,
    amount: f64,
}

async fn create_deposit(
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state
        .deposits
        .create(req.user_id, to_amount(req.amount))
        .await?;
    Ok(Json(json!({
        "deposit_id": pending.deposit.id,
        "invoice_id": pending.deposit.invoice_id,
        "pay_url": pending.pay_url,
    })))
}

/// Status poll for the mini-app while it waits for the gateway webhook.
async fn deposit_status(
    State(state): State<AppState>,
    Path(invoice_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .db
        .get_deposit_by_invoice(&invoice_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Invoice {} not found", invoice_id)))?;
    Ok(Json(json!({
        "deposit_id": record.id,
        "status": record.status,
        "amount": from_amount(record.amount),
        "net_amount": from_amount(record.net_amount),
    })))
}

#[derive(Deserialize)]
struct WithdrawalRequest {
    user_id: i64,
    amount: f64,
    recipient: String,
}

async fn request_withdrawal(
    State(state): State<AppState>,
    Json(req): Json<WithdrawalRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let receipt = state
        .withdrawals
        .request(req.user_id, to_amount(req.amount), &req.recipient)
        .await?;
    Ok(Json(json!({
        "withdrawal_id": receipt.withdrawal.id,
        "status": receipt.withdrawal.status,
        "awaiting_approval": receipt.awaiting_approval,
    })))
}

async fn cancel_withdrawal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UserAction>,
) -> Result<StatusCode, ApiError> {
    state
        .withdrawals
        .cancel(&id, req.user_id, &req.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RedeemRequest {
    user_id: i64,
    code: String,
}

async fn redeem_promo(
    State(state): State<AppState>,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = state.promos.redeem(&req.code, req.user_id).await?;
    Ok(Json(json!({ "value": from_amount(value) })))
}

async fn claim_referral(
    State(state): State<AppState>,
    Json(req): Json<UserAction>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let amount = state.promos.claim_referral(req.user_id).await?;
    Ok(Json(json!({ "claimed": from_amount(amount) })))
}

async fn fair_commitment(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "server_seed_hash": state.fair.commitment() }))
}

/// Gateway webhook: invoice paid. The fee travels in the payload; the
/// status gate makes redelivery harmless.
#[derive(Deserialize)]
struct CryptoPayWebhook {
    invoice_id: String,
    #[serde(default)]
    fee: f64,
}

async fn cryptopay_webhook(
    State(state): State<AppState>,
    Json(req): Json<CryptoPayWebhook>,
) -> Result<StatusCode, ApiError> {
    state
        .deposits
        .confirm(&req.invoice_id, to_amount(req.fee))
        .await?;
    Ok(StatusCode::OK)
}

// ===== Operator handlers =====

async fn ledger_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let snapshot = state.recalc.ensure_fresh(state.max_state_age).await?;
    Ok(Json(serde_json::to_value(&snapshot).map_err(anyhow::Error::from)?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn ledger_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let entries = state
        .ledger
        .history(params.limit.unwrap_or(50).min(500) as usize)
        .await?;
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

async fn recalculate_now(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let snapshot = state.recalc.run().await?;
    Ok(Json(serde_json::to_value(&snapshot).map_err(anyhow::Error::from)?))
}

async fn reconcile_now(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let report = state.reconcile.run().await?;
    Ok(Json(serde_json::to_value(&report).map_err(anyhow::Error::from)?))
}

async fn reconcile_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let reports = state
        .reconcile
        .history(
            params.limit.unwrap_or(20).min(100) as usize,
            params.offset.unwrap_or(0) as usize,
        )
        .await?;
    Ok(Json(json!({ "count": reports.len(), "reports": reports })))
}

async fn approve_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let record = state.withdrawals.approve(&id).await?;
    Ok(Json(json!({ "withdrawal_id": record.id, "status": record.status })))
}

#[derive(Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn reject_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.withdrawals.reject(&id, &req.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SettleEventBetRequest {
    won: bool,
    #[serde(default)]
    payout: f64,
}

async fn settle_event_bet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SettleEventBetRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let record = state
        .events
        .settle(&id, req.won, to_amount(req.payout))
        .await?;
    Ok(Json(json!({
        "bet_id": record.id,
        "status": record.status,
        "payout": from_amount(record.payout),
    })))
}

async fn refund_event_bet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.events.refund(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreatePromoRequest {
    code: String,
    value: f64,
    max_activations: i64,
}

async fn create_promo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreatePromoRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let code = state
        .promos
        .create_code(&req.code, to_amount(req.value), req.max_activations)
        .await?;
    Ok(Json(json!({
        "code": code.code,
        "value": from_amount(code.value),
        "max_activations": code.max_activations,
    })))
}

#[derive(Deserialize)]
struct OwnerWithdrawRequest {
    amount: f64,
}

async fn owner_withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OwnerWithdrawRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let receipt = state.treasury.withdraw(to_amount(req.amount)).await?;
    Ok(Json(json!({
        "transfer_id": receipt.transfer_id,
        "amount": from_amount(receipt.amount),
        "fee": from_amount(receipt.fee),
    })))
}

async fn rotate_fair_seed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &headers)?;
    let revealed = state.fair.rotate();
    Ok(Json(json!({
        "server_seed": revealed.server_seed,
        "server_seed_hash": revealed.server_seed_hash,
        "rolls": revealed.rolls,
        "next_server_seed_hash": state.fair.commitment(),
    })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != state.admin_token.as_str() {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

// ===== Error Handling =====

#[derive(Debug)]
enum ApiError {
    Internal(anyhow::Error),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<GameError> for ApiError {
    fn from(err: GameError) -> Self {
        match err {
            GameError::InvalidBet => ApiError::BadRequest(err.to_string()),
            GameError::InsufficientFunds => ApiError::Conflict(err.to_string()),
            GameError::Ledger(e) => ApiError::Internal(e.into()),
            GameError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<DuelError> for ApiError {
    fn from(err: DuelError) -> Self {
        match err {
            DuelError::InvalidStake => ApiError::BadRequest(err.to_string()),
            DuelError::InsufficientFunds
            | DuelError::NotOpen
            | DuelError::SelfJoin
            | DuelError::NotCreator => ApiError::Conflict(err.to_string()),
            DuelError::NotFound => ApiError::NotFound(err.to_string()),
            DuelError::Ledger(e) => ApiError::Internal(e.into()),
            DuelError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<EventBetError> for ApiError {
    fn from(err: EventBetError) -> Self {
        match err {
            EventBetError::InvalidStake => ApiError::BadRequest(err.to_string()),
            EventBetError::InsufficientFunds | EventBetError::NotOpen => {
                ApiError::Conflict(err.to_string())
            }
            EventBetError::Ledger(e) => ApiError::Internal(e.into()),
            EventBetError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<DepositError> for ApiError {
    fn from(err: DepositError) -> Self {
        match err {
            DepositError::InvalidAmount => ApiError::BadRequest(err.to_string()),
            DepositError::Gateway(e) => ApiError::Conflict(e.to_string()),
            DepositError::Ledger(e) => ApiError::Internal(e.into()),
            DepositError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<WithdrawalError> for ApiError {
    fn from(err: WithdrawalError) -> Self {
        match err {
            WithdrawalError::InvalidAmount | WithdrawalError::InvalidRecipient => {
                ApiError::BadRequest(err.to_string())
            }
            WithdrawalError::InFlightExists
            | WithdrawalError::InsufficientFunds
            | WithdrawalError::InsufficientGatewayHeadroom
            | WithdrawalError::InvalidState
            | WithdrawalError::NotOwner => ApiError::Conflict(err.to_string()),
            WithdrawalError::NotFound => ApiError::NotFound(err.to_string()),
            WithdrawalError::Ledger(e) => ApiError::Internal(e.into()),
            WithdrawalError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<PromoError> for ApiError {
    fn from(err: PromoError) -> Self {
        match err {
            PromoError::UnknownCode => ApiError::NotFound(err.to_string()),
            PromoError::Exhausted | PromoError::AlreadyRedeemed => {
                ApiError::Conflict(err.to_string())
            }
            PromoError::Ledger(e) => ApiError::Internal(e.into()),
            PromoError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl From<TreasuryError> for ApiError {
    fn from(err: TreasuryError) -> Self {
        match err {
            TreasuryError::Ledger(e) => ApiError::Conflict(e.to_string()),
            TreasuryError::Gateway(e) => ApiError::Conflict(e.to_string()),
            TreasuryError::Storage(e) => ApiError::Internal(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
