//! License routes (§4.9, §4.10): activation, status, and transfer.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::license::LicenseRecord;

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub license_key: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    pub license: serde_json::Value,
    pub trace_id: String,
}

pub async fn activate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<ActivateResponse>, AppError> {
    let record = state
        .license
        .activate(&req.license_key, &req.email, addr.ip())
        .await?;
    Ok(Json(ActivateResponse {
        success: true,
        license: record.redacted(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub valid: bool,
    pub status: crate::license::LicenseStatus,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub email: String,
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

impl From<LicenseRecord> for StatusResponse {
    fn from(record: LicenseRecord) -> Self {
        Self {
            valid: true,
            status: record.status,
            expires_at: record.expires_at,
            email: record.email,
            last_checked: chrono::Utc::now(),
        }
    }
}

pub async fn status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<StatusResponse>, AppError> {
    state.license.check_status_rate_limit(addr.ip()).await?;
    let record = state.license.validate(false).await?;
    Ok(Json(record.into()))
}

pub async fn status_detailed(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.license.check_status_rate_limit(addr.ip()).await?;
    let record = state.license.validate(false).await?;
    Ok(Json(record.redacted()))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub new_organization: String,
    pub reason: String,
    pub requester_email: String,
}

pub async fn transfer(
    State(state): State<AppState>,
    Json(req): Json<TransferRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!(reason = %req.reason, "license transfer requested");
    let record = state
        .license
        .transfer(&req.new_organization, &req.requester_email)
        .await?;
    Ok(Json(record.redacted()))
}
