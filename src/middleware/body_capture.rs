//! Request body capture (§4.10): buffers up to 1 MiB of the request body so the logging layer can
//! attach it to the request span, with sensitive fields redacted first. Bodies over the cap are
//! rejected by [`axum::extract::DefaultBodyLimit`] further down the stack, not here — this layer
//! only concerns itself with what it buffers for logging.

use axum::{
    body::{Body, Bytes},
    extract::Request,
    middleware::Next,
    response::Response,
};

use crate::error::redact;

pub const CAPTURE_LIMIT: usize = 1024 * 1024;

/// Request-extension carrying the redacted, UTF-8-lossy body preview for the logging layer.
#[derive(Debug, Clone)]
pub struct CapturedBody(pub String);

pub async fn capture_body(mut request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, CAPTURE_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => {
            // Oversized or malformed body: let the handler's own body extraction surface the
            // error rather than failing the request here.
            request = Request::from_parts(parts, Body::empty());
            return next.run(request).await;
        }
    };

    let preview = redact(&String::from_utf8_lossy(&bytes));
    let mut request = Request::from_parts(parts, Body::from(bytes.clone()));
    request.extensions_mut().insert(CapturedBody(preview));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use tower::ServiceExt;

    async fn handler(body: Bytes) -> String {
        String::from_utf8_lossy(&body).to_string()
    }

    #[tokio::test]
    async fn body_survives_capture() {
        let app = Router::new()
            .route("/", post(handler))
            .layer(axum::middleware::from_fn(capture_body));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), CAPTURE_LIMIT).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn license_key_in_body_is_redacted_in_the_captured_preview() {
        let app = Router::new()
            .route(
                "/",
                post(|req: Request| async move {
                    let captured = req.extensions().get::<CapturedBody>().cloned();
                    captured.map(|c| c.0).unwrap_or_default()
                }),
            )
            .layer(axum::middleware::from_fn(capture_body));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from(r#"{"license_key": "ISX1Y-ABCDE-12345-FGHIJ-67890", "ok": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), CAPTURE_LIMIT).await.unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("ABCDE"));
    }
}
