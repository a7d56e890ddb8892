//! HTTP and realtime surface.
//!
//! The HTTP side is read-mostly: snapshots come straight off the published
//! `ArcSwap`, bet preparation talks to the ledger directly, and everything
//! that mutates game state goes through the orchestrator's input queue. The
//! websocket endpoint is the overlay channel; it also carries admin commands
//! inbound.

use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::ChatEvent;
use crate::events::ServerEvent;
use crate::hub::Hub;
use crate::ledger::accounts::{BettingRoundAccount, OnChainPhase, Prediction};
use crate::ledger::{LedgerClient, LedgerError};
use crate::orchestrator::{AdminAction, AdminCommand, Input};
use crate::state::{BetSummary, GameSnapshot, Phase};

pub const MAX_USERNAME_LEN: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub ledger: Arc<LedgerClient>,
    pub input: mpsc::Sender<Input>,
    pub published: Arc<ArcSwap<GameSnapshot>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/game-status", get(game_status))
        .route("/api/current-round", get(current_round))
        .route("/api/betting-round/:round_id", get(betting_round))
        .route("/api/place-bet", post(place_bet))
        .route("/api/bet-notification", post(bet_notification))
        .route("/api/bet-status/:wallet/:round_id", get(bet_status))
        .route("/test", get(test_inject))
        .route("/status", get(legacy_status))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ======================================================================
// ERRORS
// ======================================================================

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: err.to_string(),
            },
            other => Self {
                status: StatusCode::BAD_GATEWAY,
                message: other.to_string(),
            },
        }
    }
}

// ======================================================================
// SNAPSHOT READS
// ======================================================================

async fn game_status(State(app): State<AppState>) -> Json<GameSnapshot> {
    Json(app.published.load().as_ref().clone())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentRoundResponse {
    round_id: u64,
    phase: Phase,
    betting_round_pda: Option<String>,
    escrow_pda: Option<String>,
    total_death_bets: u64,
    total_survival_bets: u64,
    time_remaining_ms: Option<u64>,
}

async fn current_round(State(app): State<AppState>) -> Json<CurrentRoundResponse> {
    let snap = app.published.load();
    Json(CurrentRoundResponse {
        round_id: snap.round_id,
        phase: snap.phase,
        betting_round_pda: snap.betting_round_pda.clone(),
        escrow_pda: snap.escrow_pda.clone(),
        total_death_bets: snap.total_death_bets,
        total_survival_bets: snap.total_survival_bets,
        time_remaining_ms: snap.time_remaining_ms,
    })
}

/// Legacy overlay endpoint: bare HP numbers.
async fn legacy_status(State(app): State<AppState>) -> Json<serde_json::Value> {
    let snap = app.published.load();
    Json(serde_json::json!({
        "bossHp": snap.boss_hp,
        "maxHp": snap.max_hp,
        "phase": snap.phase,
        "roundId": snap.round_id,
        "totalHits": snap.total_hits,
        "lastHitter": snap.last_hitter,
        "subscribers": app.hub.subscriber_count(),
    }))
}

// ======================================================================
// ON-CHAIN READS
// ======================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoundView {
    round_id: u64,
    authority: String,
    treasury: String,
    betting_start_time: i64,
    betting_end_time: i64,
    fight_end_time: i64,
    initial_hp: u32,
    current_hp: u32,
    phase: &'static str,
    total_death_bets: u64,
    total_survival_bets: u64,
    total_bets_count: u64,
    fee_percentage: u8,
    boss_defeated: bool,
    payouts_processed: bool,
}

impl From<BettingRoundAccount> for RoundView {
    fn from(r: BettingRoundAccount) -> Self {
        Self {
            round_id: r.round_id,
            authority: r.authority.to_string(),
            treasury: r.treasury.to_string(),
            betting_start_time: r.betting_start_time,
            betting_end_time: r.betting_end_time,
            fight_end_time: r.fight_end_time,
            initial_hp: r.initial_hp,
            current_hp: r.current_hp,
            phase: on_chain_phase_str(r.phase),
            total_death_bets: r.total_death_bets,
            total_survival_bets: r.total_survival_bets,
            total_bets_count: r.total_bets_count,
            fee_percentage: r.fee_percentage,
            boss_defeated: r.boss_defeated,
            payouts_processed: r.payouts_processed,
        }
    }
}

fn on_chain_phase_str(phase: OnChainPhase) -> &'static str {
    match phase {
        OnChainPhase::Betting => "betting",
        OnChainPhase::Fighting => "fighting",
        OnChainPhase::Ended => "ended",
    }
}

async fn betting_round(
    State(app): State<AppState>,
    Path(round_id): Path<u64>,
) -> Result<Json<RoundView>, ApiError> {
    let round = app.ledger.fetch_round(round_id).await?;
    Ok(Json(RoundView::from(round)))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BetStatusResponse {
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    bet: Option<BetView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BetView {
    username: String,
    amount_lamports: u64,
    prediction: Prediction,
    timestamp: i64,
    payout_claimed: bool,
}

async fn bet_status(
    State(app): State<AppState>,
    Path((wallet, round_id)): Path<(String, u64)>,
) -> Result<Json<BetStatusResponse>, ApiError> {
    let bettor = parse_wallet(&wallet)?;
    let bet = app.ledger.fetch_bet(round_id, &bettor).await?;
    Ok(Json(BetStatusResponse {
        exists: bet.is_some(),
        bet: bet.map(|b| BetView {
            username: b.username,
            amount_lamports: b.amount_lamports,
            prediction: b.prediction,
            timestamp: b.timestamp,
            payout_claimed: b.payout_claimed,
        }),
    }))
}

// ======================================================================
// BETS
// ======================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceBetRequest {
    wallet_address: String,
    username: String,
    amount: u64,
    prediction: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceBetResponse {
    /// Base64 unsigned transaction, blockhash already fresh.
    transaction: String,
    round_id: u64,
    bet_pda: String,
}

async fn place_bet(
    State(app): State<AppState>,
    Json(req): Json<PlaceBetRequest>,
) -> Result<Json<PlaceBetResponse>, ApiError> {
    let snap = app.published.load_full();
    if snap.phase != Phase::Betting {
        return Err(ApiError::bad_request("betting is not open"));
    }
    let round_id = snap.round_id;
    let bettor = parse_wallet(&req.wallet_address)?;
    let prediction =
        Prediction::from_str(&req.prediction).map_err(ApiError::bad_request)?;
    if req.amount == 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    if req.username.is_empty() || req.username.len() > MAX_USERNAME_LEN {
        return Err(ApiError::bad_request(format!(
            "username must be 1..={MAX_USERNAME_LEN} bytes"
        )));
    }
    if app.ledger.fetch_bet(round_id, &bettor).await?.is_some() {
        return Err(ApiError::conflict("bet already placed for this round"));
    }
    let transaction = app
        .ledger
        .prepare_bet_tx(round_id, &bettor, req.amount, prediction, &req.username)
        .await?;
    debug!(round_id, wallet = %bettor, amount = req.amount, "prepared bet transaction");
    Ok(Json(PlaceBetResponse {
        transaction,
        round_id,
        bet_pda: app.ledger.derive_bet_pda(round_id, &bettor).to_string(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetNotificationRequest {
    wallet_address: String,
    username: String,
    amount: u64,
    prediction: String,
}

/// Client-driven mirror of a just-confirmed bet. Display liveness only;
/// authoritative totals are read from chain on fight start.
async fn bet_notification(
    State(app): State<AppState>,
    Json(req): Json<BetNotificationRequest>,
) -> Result<StatusCode, ApiError> {
    let prediction =
        Prediction::from_str(&req.prediction).map_err(ApiError::bad_request)?;
    let bet = BetSummary {
        wallet: req.wallet_address,
        username: req.username,
        amount_lamports: req.amount,
        prediction,
        ts: (crate::now_ms() / 1000) as i64,
    };
    let _ = app.input.send(Input::BetNotification(bet)).await;
    Ok(StatusCode::ACCEPTED)
}

// ======================================================================
// TEST INJECTION / WS
// ======================================================================

#[derive(Deserialize)]
struct TestParams {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

/// Synthetic chat injection. Goes through the same queue as real chat, so it
/// only has an effect while the fight is running.
async fn test_inject(
    State(app): State<AppState>,
    Query(params): Query<TestParams>,
) -> Json<serde_json::Value> {
    let ev = ChatEvent {
        username: params.user.unwrap_or_else(|| "tester".to_string()),
        message: params.msg.unwrap_or_default(),
        ts_ms: crate::now_ms(),
    };
    let _ = app.input.send(Input::Chat(ev)).await;
    let snap = app.published.load();
    Json(serde_json::json!({ "ok": true, "phase": snap.phase }))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

async fn handle_socket(socket: WebSocket, app: AppState) {
    let (id, mut rx) = app.hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        if let WsMessage::Text(text) = msg {
            handle_client_frame(&app, id, &text).await;
        }
    }

    app.hub.unsubscribe(id);
    writer.abort();
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    admin_key: Option<String>,
    #[serde(default)]
    wallet_address: Option<String>,
}

async fn handle_client_frame(app: &AppState, subscriber_id: u64, text: &str) {
    let Ok(frame) = serde_json::from_str::<ClientFrame>(text) else {
        return;
    };
    if frame.kind != "admin" {
        return;
    }
    let action = match frame.action.as_deref() {
        Some("startBetting") | Some("start_betting") => AdminAction::StartBetting,
        Some("reset") => AdminAction::Reset,
        other => {
            warn!(subscriber = subscriber_id, action = ?other, "unknown admin action");
            app.hub.send_to(
                subscriber_id,
                ServerEvent::AdminError {
                    message: "unknown admin action".into(),
                },
            );
            return;
        }
    };
    let cmd = AdminCommand {
        action,
        admin_key: frame.admin_key.unwrap_or_default(),
        wallet_address: frame.wallet_address.unwrap_or_default(),
        subscriber_id,
    };
    let _ = app.input.send(Input::Admin(cmd)).await;
}

fn parse_wallet(wallet: &str) -> Result<Pubkey, ApiError> {
    Pubkey::from_str(wallet)
        .map_err(|_| ApiError::bad_request(format!("invalid wallet address '{wallet}'")))
}
