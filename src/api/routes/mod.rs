//! API route handlers

pub mod alerts;
pub mod credentials;
pub mod executions;
pub mod market;
pub mod operations;
pub mod settings;

use crate::api::server::AppState;
use crate::error::TradingError;
use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Generic acknowledgement
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map the engine's error taxonomy onto HTTP statuses
pub fn trading_error(err: TradingError) -> ApiError {
    let status = match &err {
        TradingError::Validation(_) => StatusCode::BAD_REQUEST,
        TradingError::CapitalExceeded { .. } => StatusCode::CONFLICT,
        TradingError::CredentialInvalid(_) => StatusCode::BAD_REQUEST,
        TradingError::CredentialsUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        TradingError::Gateway(_) => StatusCode::BAD_GATEWAY,
        TradingError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = match &err {
        TradingError::CredentialsUnavailable => {
            "Binance credentials are missing or invalid. Please provide a valid API Key and Secret Key to continue."
                .to_string()
        }
        TradingError::Gateway(e) => e.user_message(),
        TradingError::Persistence(_) => {
            error!("[API] {}", err);
            "Internal storage error".to_string()
        }
        other => other.to_string(),
    };
    if status.is_client_error() {
        warn!("[API] Request rejected: {}", err);
    }
    api_error(status, message)
}

/// Refuse exchange-facing actions until a validated key pair is active
pub async fn require_credentials(state: &AppState) -> Result<(), ApiError> {
    state.credentials.require_valid().await.map_err(trading_error)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 500;

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}
