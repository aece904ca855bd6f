//! Operation routes (§4.10): create/list/inspect/stop pipeline runs and export their history.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::operation::{OperationFilter, OperationSnapshot};
use crate::types::{OperationId, OperationState, OperationType};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartOperationRequest {
    #[serde(rename = "type")]
    pub op_type: OperationType,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Serialize)]
pub struct StartOperationResponse {
    pub operation_id: OperationId,
}

pub async fn start_operation(
    State(state): State<AppState>,
    Json(req): Json<StartOperationRequest>,
) -> Result<Json<StartOperationResponse>, AppError> {
    let operation_id = state.manager.clone().start(req.op_type, req.config)?;
    Ok(Json(StartOperationResponse { operation_id }))
}

#[derive(Debug, Deserialize)]
pub struct ListOperationsQuery {
    #[serde(rename = "type")]
    pub op_type: Option<OperationType>,
    pub state: Option<OperationState>,
}

pub async fn list_operations(
    State(state): State<AppState>,
    Query(query): Query<ListOperationsQuery>,
) -> Json<Vec<OperationSnapshot>> {
    Json(state.manager.list(OperationFilter {
        op_type: query.op_type,
        state: query.state,
    }))
}

pub async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<Json<OperationSnapshot>, AppError> {
    Ok(Json(state.manager.status(id)?))
}

/// A running operation was already started at creation time (§4.6 `Start` is create-and-launch in
/// one call), so re-POSTing `/start` on a live operation id can only conflict; this endpoint
/// exists for API-surface completeness against an operation that has already reached a terminal
/// state, where it is unambiguously an error rather than a silent no-op.
pub async fn restart_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<Json<OperationSnapshot>, AppError> {
    let snapshot = state.manager.status(id)?;
    Err(AppError::Conflict(format!(
        "operation {id} was already started (state: {:?})",
        snapshot.state
    )))
}

pub async fn stop_operation(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
) -> Result<(axum::http::StatusCode, Json<OperationSnapshot>), AppError> {
    state.manager.stop(id)?;
    let snapshot = state.manager.status(id)?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(snapshot)))
}

pub async fn update_operation_config(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Json(config): Json<Value>,
) -> Result<Json<Value>, AppError> {
    Ok(Json(state.manager.update_config(id, config)?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    pub status: Option<OperationState>,
    pub start: Option<chrono::DateTime<chrono::Utc>>,
    pub end: Option<chrono::DateTime<chrono::Utc>>,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub items: Vec<OperationSnapshot>,
}

fn filtered_history(state: &AppState, id: OperationId, query: &HistoryQuery) -> Result<Vec<OperationSnapshot>, AppError> {
    // The Manager keeps one snapshot per operation id, not a multi-run log; "history" for a given
    // id is that operation's own record plus the stage-level timeline already in its snapshot.
    let snapshot = state.manager.status(id)?;
    let mut items = vec![snapshot];
    if let Some(status) = query.status {
        items.retain(|s| s.state == status);
    }
    if let Some(start) = query.start {
        items.retain(|s| s.created_at >= start);
    }
    if let Some(end) = query.end {
        items.retain(|s| s.created_at <= end);
    }
    Ok(items)
}

pub async fn get_operation_history(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, AppError> {
    let items = filtered_history(&state, id, &query)?;
    let total = items.len();
    let start = (query.page.saturating_sub(1)) * query.page_size;
    let page_items = items.into_iter().skip(start).take(query.page_size).collect();
    Ok(Json(HistoryPage {
        page: query.page,
        page_size: query.page_size,
        total,
        items: page_items,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default = "default_format")]
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

fn default_format() -> ExportFormat {
    ExportFormat::Json
}

pub async fn export_operation_history(
    State(state): State<AppState>,
    Path(id): Path<OperationId>,
    Query(query): Query<ExportQuery>,
) -> Result<axum::response::Response, AppError> {
    use axum::response::IntoResponse;

    let items = filtered_history(
        &state,
        id,
        &HistoryQuery {
            page: 1,
            page_size: usize::MAX,
            status: None,
            start: None,
            end: None,
        },
    )?;

    match query.format {
        ExportFormat::Json => Ok(Json(items).into_response()),
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(vec![]);
            writer
                .write_record(["operation_id", "type", "state", "created_at", "finished_at"])
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            for item in &items {
                writer
                    .write_record([
                        item.id.to_string(),
                        item.op_type.as_str().to_string(),
                        format!("{:?}", item.state),
                        item.created_at.to_rfc3339(),
                        item.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    ])
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            }
            let bytes = writer.into_inner().map_err(|e| AppError::Internal(anyhow::anyhow!(e.to_string())))?;
            let mut response = bytes.into_response();
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderValue::from_static("text/csv"),
            );
            Ok(response)
        }
    }
}
