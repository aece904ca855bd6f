//! Shared application state (C10), threaded through every handler via `axum::extract::State`.

use std::path::PathBuf;
use std::sync::Arc;

use crate::events::HubHandle;
use crate::license::LicenseManager;
use crate::operation::OperationManager;

/// Process-wide settings distinct from per-operation config (§4 `[EXPANDED]` AppConfig).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub workspace_root: PathBuf,
    pub listen_addr: String,
    pub dev: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<OperationManager>,
    pub license: Arc<LicenseManager>,
    pub hub: HubHandle,
    pub config: AppConfig,
    pub prometheus: metrics_exporter_prometheus::PrometheusHandle,
}
