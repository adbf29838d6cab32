//! Exchange credential endpoints
//!
//! Secrets go in, only masked values come out.

use super::{trading_error, ApiError};
use crate::api::server::AppState;
use crate::services::CredentialStatus;
use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SubmitCredentialsRequest {
    pub api_key: String,
    pub api_secret: String,
    /// PRODUCTION or TESTNET; defaults to the configured environment
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivateEnvironmentRequest {
    pub environment: String,
}

pub async fn get_status(State(state): State<AppState>) -> Json<CredentialStatus> {
    Json(state.credentials.status().await)
}

/// Validate a key pair against the exchange and make it the active one
pub async fn submit_credentials(
    State(state): State<AppState>,
    Json(req): Json<SubmitCredentialsRequest>,
) -> Result<Json<CredentialStatus>, ApiError> {
    let environment = req
        .environment
        .unwrap_or_else(|| state.config.environment.as_str().to_string());
    let record = state
        .credentials
        .validate_and_persist(&req.api_key, &req.api_secret, &environment)
        .await
        .map_err(trading_error)?;
    info!("[API] Credentials {} active for {}", record.id, record.environment);
    Ok(Json(state.credentials.status().await))
}

pub async fn activate_environment(
    State(state): State<AppState>,
    Json(req): Json<ActivateEnvironmentRequest>,
) -> Result<Json<CredentialStatus>, ApiError> {
    state
        .credentials
        .activate_environment(&req.environment)
        .await
        .map_err(trading_error)?;
    Ok(Json(state.credentials.status().await))
}

/// Re-check the held pair, e.g. after an exchange outage
pub async fn revalidate(State(state): State<AppState>) -> Result<Json<CredentialStatus>, ApiError> {
    let valid = state.credentials.revalidate().await.map_err(trading_error)?;
    info!("[API] Revalidation result: {}", valid);
    Ok(Json(state.credentials.status().await))
}
