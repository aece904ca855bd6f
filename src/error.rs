//! Problem/Error model (C1).
//!
//! Every failure surfaces as a [`Problem`], an RFC 7807-flavored structured value. Internal
//! failures are represented by the `thiserror`-derived [`AppError`] sum type; [`AppError::into_problem`]
//! is the single place that walks an error chain and performs redaction, so no handler constructs
//! a `Problem` by hand.

use std::collections::BTreeMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The enumerated error kinds (§4.1), including domain extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    RateLimit,
    Timeout,
    PayloadTooLarge,
    Internal,
    ServiceUnavailable,
    LicenseExpired,
    LicenseNotActivated,
    LicenseMismatch,
    InvalidLicenseKey,
    InvalidLicenseFormat,
    ReactivationLimitExceeded,
    AlreadyActivatedOnDevice,
    OperationNotFound,
    OperationAlreadyRunning,
    DataNotFound,
    DataCorrupted,
    WebSocketUpgrade,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        use ErrorKind::*;
        match self {
            Validation | InvalidLicenseKey | InvalidLicenseFormat => StatusCode::BAD_REQUEST,
            Unauthorized | LicenseNotActivated | LicenseExpired => StatusCode::UNAUTHORIZED,
            Forbidden | LicenseMismatch | AlreadyActivatedOnDevice => StatusCode::FORBIDDEN,
            NotFound | OperationNotFound | DataNotFound => StatusCode::NOT_FOUND,
            Conflict | OperationAlreadyRunning => StatusCode::CONFLICT,
            RateLimit | ReactivationLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Timeout => StatusCode::GATEWAY_TIMEOUT,
            PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DataCorrupted => StatusCode::UNPROCESSABLE_ENTITY,
            WebSocketUpgrade => StatusCode::BAD_REQUEST,
            Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            Validation => "VALIDATION",
            NotFound => "NOT_FOUND",
            Unauthorized => "UNAUTHORIZED",
            Forbidden => "FORBIDDEN",
            Conflict => "CONFLICT",
            RateLimit => "RATE_LIMIT",
            Timeout => "TIMEOUT",
            PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Internal => "INTERNAL",
            ServiceUnavailable => "SERVICE_UNAVAILABLE",
            LicenseExpired => "LICENSE_EXPIRED",
            LicenseNotActivated => "LICENSE_NOT_ACTIVATED",
            LicenseMismatch => "LICENSE_MISMATCH",
            InvalidLicenseKey => "INVALID_LICENSE_KEY",
            InvalidLicenseFormat => "INVALID_LICENSE_FORMAT",
            ReactivationLimitExceeded => "REACTIVATION_LIMIT_EXCEEDED",
            AlreadyActivatedOnDevice => "ALREADY_ACTIVATED_ON_DEVICE",
            OperationNotFound => "OPERATION_NOT_FOUND",
            OperationAlreadyRunning => "OPERATION_ALREADY_RUNNING",
            DataNotFound => "DATA_NOT_FOUND",
            DataCorrupted => "DATA_CORRUPTED",
            WebSocketUpgrade => "WEBSOCKET_UPGRADE_FAILED",
        }
    }

    fn type_uri(&self) -> String {
        format!("/errors/{}", self.code().to_lowercase().replace('_', "-"))
    }

    fn title(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            Validation => "Validation failed",
            NotFound => "Resource not found",
            Unauthorized => "Unauthorized",
            Forbidden => "Forbidden",
            Conflict => "Conflict",
            RateLimit => "Rate limit exceeded",
            Timeout => "Operation timed out",
            PayloadTooLarge => "Payload too large",
            Internal => "Internal error",
            ServiceUnavailable => "Service unavailable",
            LicenseExpired => "License expired",
            LicenseNotActivated => "License not activated",
            LicenseMismatch => "License bound to a different device",
            InvalidLicenseKey => "Invalid license key",
            InvalidLicenseFormat => "Invalid license key format",
            ReactivationLimitExceeded => "Reactivation limit exceeded",
            AlreadyActivatedOnDevice => "License already active on this device",
            OperationNotFound => "Operation not found",
            OperationAlreadyRunning => "Operation already running",
            DataNotFound => "Data not found",
            DataCorrupted => "Data corrupted",
            WebSocketUpgrade => "WebSocket upgrade failed",
        }
    }

    /// Classification used by the job queue to decide whether a stage attempt may retry (§7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::ServiceUnavailable
        )
    }
}

/// A single field-level validation violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

/// The RFC 7807-style wire model (§4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub type_uri: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub trace_id: String,
    pub error_code: String,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Internal error sum type. Every fallible async boundary returns this (or a more specific
/// `thiserror` type that converts into it via `#[from]`), so `?` works end to end and handlers
/// convert to [`Problem`] with [`AppError::into_problem`].
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("validation failed")]
    ValidationFields(Vec<FieldViolation>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("operation {0} not found")]
    OperationNotFound(uuid::Uuid),
    #[error("operation {0} already running")]
    OperationAlreadyRunning(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimit { retry_after_secs: u64 },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("license error: {0}")]
    License(#[from] crate::license::LicenseError),
    #[error("data corrupted: {0}")]
    DataCorrupted(String),
    #[error("data not found: {0}")]
    DataNotFound(String),
    #[error(transparent)]
    Stage(#[from] crate::stages::StageError),
    #[error("websocket upgrade failed: {0}")]
    WebSocketUpgrade(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) | AppError::ValidationFields(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::OperationNotFound(_) => ErrorKind::OperationNotFound,
            AppError::OperationAlreadyRunning(_) => ErrorKind::OperationAlreadyRunning,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::RateLimit { .. } => ErrorKind::RateLimit,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::License(e) => e.kind(),
            AppError::DataCorrupted(_) => ErrorKind::DataCorrupted,
            AppError::DataNotFound(_) => ErrorKind::DataNotFound,
            AppError::Stage(e) => e.kind(),
            AppError::WebSocketUpgrade(_) => ErrorKind::WebSocketUpgrade,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Convert to the wire model. `include_stack` mirrors `--dev`: only then does the `detail`
    /// field carry the full `{:#}` chain instead of a generic message.
    pub fn into_problem(self, trace_id: String, instance: Option<String>, include_stack: bool) -> Problem {
        let kind = self.kind();
        let mut extensions = BTreeMap::new();

        let detail = match &self {
            AppError::ValidationFields(violations) => {
                extensions.insert(
                    "errors".to_string(),
                    serde_json::to_value(violations).unwrap_or_default(),
                );
                None
            }
            AppError::RateLimit { retry_after_secs } => {
                extensions.insert("retry_after".to_string(), Value::from(*retry_after_secs));
                Some(format!("retry after {retry_after_secs}s"))
            }
            AppError::OperationAlreadyRunning(ty) => {
                extensions.insert("operation_type".to_string(), Value::from(ty.clone()));
                Some(format!("an operation of type '{ty}' is already running"))
            }
            AppError::License(e) => {
                e.extend_problem(&mut extensions);
                Some(redact(&e.to_string()))
            }
            other => {
                if include_stack {
                    Some(redact(&format!("{other:#}")))
                } else {
                    Some(redact(&other.to_string()))
                }
            }
        };

        Problem {
            type_uri: kind.type_uri(),
            title: kind.title().to_string(),
            status: kind.status().as_u16(),
            detail,
            instance,
            trace_id,
            error_code: kind.code().to_string(),
            extensions,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Handlers that can't thread a trace id through use a fresh one; the trace middleware's
        // id is the one actually logged against this request via `tracing::Span::current()`.
        let trace_id = uuid::Uuid::new_v4().to_string();
        self.into_problem(trace_id, None, false).into_response()
    }
}

/// Denylist of field/key names whose values are redacted in [`redact`], logs, and extensions.
const SENSITIVE_KEYS: &[&str] = &[
    "license_key",
    "token",
    "password",
    "authorization",
    "credential",
    "ssn",
    "credit_card",
];

/// Best-effort scrub of sensitive substrings from free-text error details.
///
/// This is not a general-purpose PII scanner; it only protects against the known-sensitive
/// fields this system handles (license keys, bearer tokens) leaking into logs or Problem bodies.
pub fn redact(input: &str) -> String {
    let mut output = input.to_string();
    for key in SENSITIVE_KEYS {
        if let Some(idx) = output.to_lowercase().find(key) {
            // Redact from just after the key through the next whitespace/quote/comma.
            let rest = &output[idx..];
            if let Some(end) = rest.find(|c: char| c == '\n' || c == ',') {
                output.replace_range(idx..idx + end, &format!("{key}=[REDACTED]"));
            }
        }
    }
    output
}

/// Redact all but the first 5 and last 4 characters of a license key for display/logging.
pub fn redact_license_key(key: &str) -> String {
    let stripped: String = key.chars().filter(|c| *c != '-').collect();
    if stripped.len() <= 9 {
        return "[REDACTED]".to_string();
    }
    let head: String = stripped.chars().take(5).collect();
    let tail: String = stripped.chars().skip(stripped.len() - 4).collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_license_key_keeps_only_head_and_tail() {
        let redacted = redact_license_key("ISX1Y-ABCDE-12345-FGHIJ-67890");
        assert_eq!(redacted, "ISX1Y...7890");
        assert!(!redacted.contains("ABCDE"));
    }

    #[test]
    fn problem_round_trips_through_json() {
        let err = AppError::Validation("bad config".to_string());
        let problem = err.into_problem("trace-1".to_string(), Some("/api/v1/operations".to_string()), false);
        let json = serde_json::to_string(&problem).unwrap();
        let decoded: Problem = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.trace_id, "trace-1");
        assert_eq!(decoded.error_code, "VALIDATION");
        assert_eq!(decoded.status, 400);
    }

    #[test]
    fn unknown_error_chain_maps_to_internal() {
        let err = AppError::Internal(anyhow::anyhow!("boom"));
        let problem = err.into_problem("t".to_string(), None, false);
        assert_eq!(problem.error_code, "INTERNAL");
        assert_eq!(problem.status, 500);
    }

    #[test]
    fn retryable_classification_matches_taxonomy() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::DataCorrupted.is_retryable());
    }
}
