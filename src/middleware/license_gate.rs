//! License gate middleware (§4.10): every request other than the exempted paths must carry a
//! valid, cached-or-freshly-checked license. Exempted so the client can always activate a license
//! or probe liveness without one.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::trace::TraceId;
use crate::error::AppError;
use crate::license::LicenseManager;

const EXEMPT_PREFIXES: &[&str] = &["/api/v1/license", "/healthz", "/readyz"];

fn is_exempt(path: &str) -> bool {
    EXEMPT_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

pub async fn require_license(
    State(license): State<Arc<LicenseManager>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_exempt(request.uri().path()) {
        return next.run(request).await;
    }

    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    match license.validate(false).await {
        Ok(_) => next.run(request).await,
        Err(e) => AppError::License(e).into_problem(trace_id, Some(request.uri().path().to_string()), false).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exempts_license_health_and_ready_paths() {
        assert!(is_exempt("/api/v1/license/activate"));
        assert!(is_exempt("/healthz"));
        assert!(is_exempt("/readyz"));
        assert!(!is_exempt("/api/v1/operations"));
    }
}
