//! Trace ID assignment, first in the middleware stack (§4.10).
//!
//! Reads an inbound `x-trace-id` header if the caller already has one (useful for clients that
//! correlate across retries), otherwise mints a fresh UUID. The id is stashed in request
//! extensions for downstream layers and handlers, echoed back on the response, and recorded on
//! the `tracing` span the logging layer opens next.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Request-extension wrapper so handlers can pull the trace id without re-parsing headers.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

pub async fn assign_trace_id(mut request: Request<Body>, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    async fn handler() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn mints_a_trace_id_when_absent() {
        let app = Router::new()
            .route("/", get(handler))
            .layer(axum::middleware::from_fn(assign_trace_id));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().contains_key(TRACE_ID_HEADER));
    }

    #[tokio::test]
    async fn echoes_an_inbound_trace_id() {
        let app = Router::new()
            .route("/", get(handler))
            .layer(axum::middleware::from_fn(assign_trace_id));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(TRACE_ID_HEADER, "caller-supplied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(TRACE_ID_HEADER).unwrap(), "caller-supplied");
    }
}
