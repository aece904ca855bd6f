//! HTTP API surface (§4.10 C10): state, route handlers, and router assembly.

pub mod health;
pub mod license_routes;
pub mod operations;
pub mod router;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use state::{AppConfig, AppState};
