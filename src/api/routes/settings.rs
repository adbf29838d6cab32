//! Trading and daily purchase settings

use super::{trading_error, ApiError};
use crate::api::server::AppState;
use crate::services::TradingParameters;
use crate::types::DailyPurchaseSettings;
use axum::{extract::State, Json};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct UpdateTradingRequest {
    pub capital_threshold: Option<Decimal>,
    pub target_profit_percent: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDailyPurchaseRequest {
    pub symbol: String,
    pub quote_amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct DailyPurchaseResponse {
    pub settings: Option<DailyPurchaseSettings>,
    pub execution_hour_utc: u32,
}

pub async fn get_trading(State(state): State<AppState>) -> Json<TradingParameters> {
    Json(state.settings.current().await)
}

pub async fn update_trading(
    State(state): State<AppState>,
    Json(req): Json<UpdateTradingRequest>,
) -> Result<Json<TradingParameters>, ApiError> {
    let updated = state
        .settings
        .update(req.capital_threshold, req.target_profit_percent)
        .await
        .map_err(trading_error)?;
    Ok(Json(updated))
}

pub async fn get_daily_purchase(State(state): State<AppState>) -> Result<Json<DailyPurchaseResponse>, ApiError> {
    let settings = state.daily_settings.active_settings().await.map_err(trading_error)?;
    let execution_hour_utc = state.daily_settings.resolve_execution_hour().await;
    Ok(Json(DailyPurchaseResponse {
        settings,
        execution_hour_utc,
    }))
}

pub async fn update_daily_purchase(
    State(state): State<AppState>,
    Json(req): Json<UpdateDailyPurchaseRequest>,
) -> Result<Json<DailyPurchaseResponse>, ApiError> {
    let saved = state
        .daily_settings
        .save_settings(&req.symbol, req.quote_amount)
        .await
        .map_err(trading_error)?;
    let execution_hour_utc = saved.execution_hour_utc;
    Ok(Json(DailyPurchaseResponse {
        settings: Some(saved),
        execution_hour_utc,
    }))
}
