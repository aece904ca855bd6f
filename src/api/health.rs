//! Health, readiness, and metrics endpoints (§4.10 C12).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Process liveness only — never touches the workspace or the license gate.
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub workspace_writable: bool,
    pub license_checked: bool,
}

/// Readiness additionally checks the workspace root is writable and the license gate has
/// completed at least one startup check (§4.10).
pub async fn readyz(State(state): State<AppState>) -> Json<ReadyResponse> {
    let probe = state.config.workspace_root.join(".readyz-probe");
    let workspace_writable = tokio::fs::write(&probe, b"ok").await.is_ok();
    if workspace_writable {
        let _ = tokio::fs::remove_file(&probe).await;
    }
    let license_checked = state.license.validate(false).await.is_ok();

    Json(ReadyResponse {
        ready: workspace_writable && license_checked,
        workspace_writable,
        license_checked,
    })
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus.render()
}
