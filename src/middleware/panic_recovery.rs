//! Panic recovery middleware (§4.10, §7): a panicking handler must not take the whole server down
//! or leave the connection hanging. `std::panic::catch_unwind` isn't `Send`-safe across an
//! `.await`, so this wraps the downstream future with `futures_util::FutureExt::catch_unwind`
//! instead, the async-native translation of the same idea.

use std::panic::AssertUnwindSafe;

use axum::{body::Body, extract::Request, middleware::Next, response::{IntoResponse, Response}};
use futures_util::FutureExt;

use super::trace::TraceId;
use crate::error::AppError;

pub async fn recover_panics(request: Request<Body>, next: Next) -> Response {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            tracing::error!(trace_id = %trace_id, panic = %message, "request handler panicked");
            let err = AppError::Internal(anyhow::anyhow!("internal error"));
            err.into_problem(trace_id, None, false).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use tower::ServiceExt;

    async fn panics() -> &'static str {
        panic!("boom");
    }

    async fn ok_handler() -> &'static str {
        "fine"
    }

    #[tokio::test]
    async fn a_panicking_handler_becomes_a_500_problem() {
        let app = Router::new()
            .route("/boom", get(panics))
            .layer(axum::middleware::from_fn(recover_panics));
        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn a_healthy_handler_is_unaffected() {
        let app = Router::new()
            .route("/ok", get(ok_handler))
            .layer(axum::middleware::from_fn(recover_panics));
        let response = app
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
