use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::{HistoryFilter, HistoryPage, PortfolioValuation, WalletView};
use crate::models::{Account, CashKind, CashRequest, Position, TradeRequest, TradeSide, TransactionRecord};

use super::{error::ApiError, AppState};

/// Success envelope: `{ "success": true, "data": ... }`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope { success: true, data }))
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountBody {
    pub user_id: String,
    pub initial_balance: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeBody {
    pub user_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub idempotency_key: Option<String>,
}

impl TradeBody {
    fn into_request(self, side: TradeSide) -> TradeRequest {
        TradeRequest {
            account_id: self.user_id,
            symbol: self.symbol,
            side,
            quantity: self.quantity,
            price: self.price,
            idempotency_key: self.idempotency_key,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashBody {
    pub user_id: String,
    pub amount: Decimal,
    pub note: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountParams {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub user_id: String,
    pub symbol: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationBody {
    pub user_id: String,
    #[serde(default)]
    pub marks: HashMap<String, Decimal>,
}

/// # POST /accounts
pub async fn open_account(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OpenAccountBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<Account>>), ApiError> {
    let payload = body(payload)?;
    let account = state
        .engine
        .open_account(&payload.user_id, payload.initial_balance.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(Envelope { success: true, data: account })))
}

/// # POST /trade/buy
pub async fn buy(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TradeBody>, JsonRejection>,
) -> ApiResult<TransactionRecord> {
    let request = body(payload)?.into_request(TradeSide::Buy);
    ok(state.engine.execute(&request).await?.record)
}

/// # POST /trade/sell
pub async fn sell(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TradeBody>, JsonRejection>,
) -> ApiResult<TransactionRecord> {
    let request = body(payload)?.into_request(TradeSide::Sell);
    ok(state.engine.execute(&request).await?.record)
}

async fn move_cash(state: &AppState, kind: CashKind, payload: CashBody) -> ApiResult<TransactionRecord> {
    let request = CashRequest {
        account_id: payload.user_id,
        kind,
        amount: payload.amount,
        note: payload.note,
        idempotency_key: payload.idempotency_key,
    };
    ok(state.engine.apply_cash(&request).await?.record)
}

/// # POST /wallet/deposit
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CashBody>, JsonRejection>,
) -> ApiResult<TransactionRecord> {
    move_cash(&state, CashKind::Deposit, body(payload)?).await
}

/// # POST /wallet/withdraw
pub async fn withdraw(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CashBody>, JsonRejection>,
) -> ApiResult<TransactionRecord> {
    move_cash(&state, CashKind::Withdraw, body(payload)?).await
}

/// # POST /wallet/reward
pub async fn reward(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CashBody>, JsonRejection>,
) -> ApiResult<TransactionRecord> {
    move_cash(&state, CashKind::Reward, body(payload)?).await
}

/// # GET /wallet?userId=
/// Balance, recent transactions, open positions and lifetime totals from one snapshot.
pub async fn wallet(
    State(state): State<Arc<AppState>>,
    params: Result<Query<AccountParams>, QueryRejection>,
) -> ApiResult<WalletView> {
    let params = query(params)?;
    ok(state.query.wallet(&params.user_id).await?)
}

/// # GET /transactions
pub async fn transactions(
    State(state): State<Arc<AppState>>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> ApiResult<HistoryPage> {
    let params = query(params)?;
    let kind = params
        .kind
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let filter = HistoryFilter {
        symbol: params.symbol,
        kind,
        from: params.from,
        to: params.to,
        limit: params.limit,
        offset: params.offset,
    };
    ok(state.query.history(&params.user_id, &filter).await?)
}

/// # GET /portfolio?userId=
pub async fn portfolio(
    State(state): State<Arc<AppState>>,
    params: Result<Query<AccountParams>, QueryRejection>,
) -> ApiResult<Vec<Position>> {
    let params = query(params)?;
    ok(state.query.positions(&params.user_id).await?)
}

/// # POST /portfolio/valuation
pub async fn valuation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValuationBody>, JsonRejection>,
) -> ApiResult<PortfolioValuation> {
    let payload = body(payload)?;
    ok(state.query.valuation(&payload.user_id, &payload.marks).await?)
}
