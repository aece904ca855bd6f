//! HTTP middleware stack (§4.10): trace id -> logging -> body capture -> panic recovery ->
//! license gate -> rate limit -> handler.

pub mod body_capture;
pub mod license_gate;
pub mod logging;
pub mod panic_recovery;
pub mod rate_limit;
pub mod trace;

pub use body_capture::{capture_body, CapturedBody};
pub use license_gate::require_license;
pub use logging::request_logging;
pub use panic_recovery::recover_panics;
pub use rate_limit::{RateLimitConfig, RateLimitLayer};
pub use trace::{assign_trace_id, TraceId};
