//! Execution history endpoints

use super::{api_error, clamp_limit, trading_error, ApiError};
use crate::api::server::AppState;
use crate::types::{ExecutionRecord, OperationType, Page};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ExecutionQuery {
    pub limit: Option<u32>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// BUY, SELL or DAILY_BUY
    pub operation_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionsResponse {
    pub records: Vec<ExecutionRecord>,
    pub total: usize,
}

fn parse_type(raw: Option<&str>) -> Result<Option<OperationType>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<OperationType>()
            .map(Some)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string())),
    }
}

pub async fn list_executions(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<ExecutionsResponse>, ApiError> {
    let operation_type = parse_type(query.operation_type.as_deref())?;
    let records = state
        .schedule
        .list_recent(clamp_limit(query.limit), operation_type)
        .await
        .map_err(trading_error)?;
    let total = records.len();
    Ok(Json(ExecutionsResponse { records, total }))
}

pub async fn list_executions_page(
    State(state): State<AppState>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<Page<ExecutionRecord>>, ApiError> {
    let operation_type = parse_type(query.operation_type.as_deref())?;
    let page = state
        .schedule
        .list_page(clamp_limit(query.page_size), query.page.unwrap_or(1), operation_type)
        .await
        .map_err(trading_error)?;
    Ok(Json(page))
}
