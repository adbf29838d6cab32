//! Price alert endpoints

use super::{clamp_limit, trading_error, ApiError, LimitQuery};
use crate::api::server::AppState;
use crate::types::PriceAlert;
use axum::{
    extract::{Query, State},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    pub recipient: String,
    pub symbol: String,
    pub min_threshold: Decimal,
    pub max_threshold: Decimal,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<PriceAlert>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let alerts = state
        .alerts
        .list_alerts(clamp_limit(query.limit))
        .await
        .map_err(trading_error)?;
    Ok(Json(AlertsResponse { alerts }))
}

pub async fn create_alert(
    State(state): State<AppState>,
    Json(req): Json<CreateAlertRequest>,
) -> Result<Json<PriceAlert>, ApiError> {
    let alert = state
        .alerts
        .create_alert(&req.recipient, &req.symbol, req.min_threshold, req.max_threshold)
        .await
        .map_err(trading_error)?;
    Ok(Json(alert))
}
