//! Router assembly (§4.10): versioned under `/api/v1`, layered with the middleware stack in the
//! order §4.10 requires, using the same multi-router `.merge()`/`.layer()` composition style.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::middleware::body_capture::CAPTURE_LIMIT;
use crate::middleware::rate_limit::rate_limit_middleware;
use crate::middleware::{assign_trace_id, capture_body, recover_panics, request_logging, require_license, RateLimitConfig, RateLimitLayer};

use super::health;
use super::license_routes;
use super::operations;
use super::state::AppState;
use super::ws;

pub fn build_router(state: AppState) -> Router {
    let license_router = Router::new()
        .route("/license/activate", post(license_routes::activate))
        .route("/license/status", get(license_routes::status))
        .route("/license/status/detailed", get(license_routes::status_detailed))
        .route("/license/transfer", post(license_routes::transfer));

    let operation_router = Router::new()
        .route("/operations", post(operations::start_operation).get(operations::list_operations))
        .route("/operations/:id", get(operations::get_operation))
        .route("/operations/:id/start", post(operations::restart_operation))
        .route("/operations/:id/stop", post(operations::stop_operation))
        .route("/operations/:id/config", put(operations::update_operation_config))
        .route("/operations/:id/history", get(operations::get_operation_history))
        .route("/operations/:id/history/export", get(operations::export_operation_history));

    let ws_router = Router::new()
        .route("/ws", get(ws::upgrade))
        .route("/ws/operations/:id", get(ws::upgrade_for_operation));

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    // Last-applied = outermost = executes first, so this chain runs license gate before rate
    // limit, matching §4.10's "license gate -> rate limit -> handler".
    let v1 = Router::new()
        .merge(license_router)
        .merge(operation_router)
        .merge(ws_router)
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(axum::middleware::from_fn_with_state(state.license.clone(), require_license));

    let health_router = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics));

    // Same last-applied-outermost rule gives: cors -> trace -> logging -> capture -> panic ->
    // body limit -> [license -> rate limit] -> handler, matching §4.10 exactly.
    Router::new()
        .nest("/api/v1", v1)
        .merge(health_router)
        .layer(DefaultBodyLimit::max(CAPTURE_LIMIT))
        .layer(axum::middleware::from_fn(recover_panics))
        .layer(axum::middleware::from_fn(capture_body))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(axum::middleware::from_fn(assign_trace_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
