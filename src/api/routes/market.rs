//! Market lookups

use super::{require_credentials, trading_error, ApiError};
use crate::api::server::AppState;
use crate::exchange::OpenOrder;
use crate::services::{exchange_call, HistoryPeriod, PriceSnapshot, PRICE_TIMEOUT};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct SymbolsResponse {
    pub symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenOrdersQuery {
    pub symbol: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OpenOrdersResponse {
    pub symbol: String,
    pub orders: Vec<OpenOrder>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub symbol: Option<String>,
    pub period: Option<String>,
}

fn symbol_or_default(state: &AppState, symbol: Option<String>) -> String {
    symbol
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.config.trade_symbol.clone())
}

pub async fn list_symbols(State(state): State<AppState>) -> Result<Json<SymbolsResponse>, ApiError> {
    let symbols = state.symbols.tradable_symbols().await.map_err(trading_error)?;
    Ok(Json(SymbolsResponse { symbols }))
}

/// Orders resting on the book for a symbol (defaults to the trading pair)
pub async fn list_open_orders(
    State(state): State<AppState>,
    Query(query): Query<OpenOrdersQuery>,
) -> Result<Json<OpenOrdersResponse>, ApiError> {
    require_credentials(&state).await?;

    let symbol = symbol_or_default(&state, query.symbol);
    let orders = exchange_call("open orders", PRICE_TIMEOUT, state.gateway.open_orders(&symbol))
        .await
        .map_err(trading_error)?;
    Ok(Json(OpenOrdersResponse { symbol, orders }))
}

/// Closing prices for 1D, 1W, 1M, 3M or 1Y (default 1D)
pub async fn price_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<PriceSnapshot>, ApiError> {
    let period = query
        .period
        .as_deref()
        .unwrap_or("1D")
        .parse::<HistoryPeriod>()
        .map_err(trading_error)?;
    let symbol = symbol_or_default(&state, query.symbol);

    let snapshot = state.history.snapshot(&symbol, period).await.map_err(trading_error)?;
    Ok(Json(snapshot))
}
