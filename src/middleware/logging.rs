//! Structured request logging (§4.10, C12): one span per request carrying the trace id assigned
//! by [`super::trace::assign_trace_id`], with the captured body preview from
//! [`super::body_capture`] attached when present.

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use super::body_capture::CapturedBody;
use super::trace::TraceId;

const SKIP_PATHS: &[&str] = &["/healthz", "/readyz"];

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if SKIP_PATHS.contains(&path.as_str()) {
        return next.run(request).await;
    }

    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let body_preview = request.extensions().get::<CapturedBody>().map(|b| b.0.clone());

    let start = Instant::now();
    let span = tracing::info_span!(
        "http_request",
        method = %method,
        path = %path,
        trace_id = %trace_id,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );
    let _guard = span.enter();

    let response = next.run(request).await;
    let latency = start.elapsed();
    let status = response.status().as_u16();

    tracing::Span::current().record("status", status);
    tracing::Span::current().record("latency_ms", latency.as_millis() as u64);

    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms = latency.as_millis(), trace_id = %trace_id, body = body_preview.as_deref().unwrap_or(""), "request failed");
    } else {
        info!(method = %method, path = %path, status, latency_ms = latency.as_millis(), trace_id = %trace_id, "request completed");
    }

    response
}
