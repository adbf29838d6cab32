//! Position and automation endpoints

use super::{api_error, clamp_limit, require_credentials, trading_error, ApiError, LimitQuery, PageQuery};
use crate::api::server::AppState;
use crate::services::{CycleOutcome, PurchaseReceipt};
use crate::types::{NewPurchase, Page, ScheduledOperation, TradingOperation};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct OperationsResponse {
    pub operations: Vec<TradingOperation>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub scheduled: Vec<ScheduledOperation>,
}

/// Market buy by quote amount, protected by a limit sell
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub symbol: String,
    pub quote_amount: Decimal,
    pub target_profit_percent: Option<Decimal>,
}

/// A purchase already executed elsewhere
#[derive(Debug, Deserialize)]
pub struct RecordPurchaseRequest {
    pub symbol: String,
    pub quantity: Decimal,
    pub purchase_price: Decimal,
    pub target_profit_percent: Option<Decimal>,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
}

pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<OperationsResponse>, ApiError> {
    let operations = state
        .ledger
        .list_operations(clamp_limit(query.limit))
        .await
        .map_err(trading_error)?;
    let total = operations.len();
    Ok(Json(OperationsResponse { operations, total }))
}

pub async fn list_operations_page(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<TradingOperation>>, ApiError> {
    let page = state
        .ledger
        .list_operations_page(clamp_limit(query.page_size), query.page.unwrap_or(1))
        .await
        .map_err(trading_error)?;
    Ok(Json(page))
}

pub async fn purchase(
    State(state): State<AppState>,
    Json(req): Json<PurchaseRequest>,
) -> Result<Json<PurchaseReceipt>, ApiError> {
    require_credentials(&state).await?;

    let receipt = state
        .purchases
        .execute_purchase(&req.symbol, req.quote_amount, req.target_profit_percent)
        .await
        .map_err(trading_error)?;

    if let Some(sell_error) = &receipt.sell_error {
        return Err(api_error(
            StatusCode::BAD_GATEWAY,
            format!(
                "Operation {} recorded but the sell order could not be created: {}",
                receipt.operation.id, sell_error
            ),
        ));
    }
    Ok(Json(receipt))
}

pub async fn record_purchase(
    State(state): State<AppState>,
    Json(req): Json<RecordPurchaseRequest>,
) -> Result<Json<TradingOperation>, ApiError> {
    require_credentials(&state).await?;

    let operation = state
        .ledger
        .record_purchase(NewPurchase {
            symbol: req.symbol,
            quantity: req.quantity,
            purchase_price: req.purchase_price,
            target_profit_percent: req.target_profit_percent,
            buy_order_id: req.buy_order_id,
            sell_order_id: req.sell_order_id,
        })
        .await
        .map_err(trading_error)?;

    if let Err(e) = state.schedule.enqueue_if_idle().await {
        warn!("[API] Could not schedule liquidation check: {}", e);
    }
    Ok(Json(operation))
}

/// Run one automation cycle now
pub async fn execute_next(State(state): State<AppState>) -> Result<Json<CycleOutcome>, ApiError> {
    require_credentials(&state).await?;

    info!("[API] Manual automation cycle requested");
    let outcome = state.automation.clone().run_manual().await.map_err(trading_error)?;
    Ok(Json(outcome))
}

pub async fn list_schedule(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let scheduled = state
        .schedule
        .list_scheduled(clamp_limit(query.limit))
        .await
        .map_err(trading_error)?;
    Ok(Json(ScheduleResponse { scheduled }))
}
