//! Intake API crate - axum HTTP server for channel webhooks, the web chat
//! widget, and the operator endpoints around interviews.
//!
//! Provides the Telegram webhook, web widget sessions and SSE reply
//! streams, candidate response and pin management, interview completion
//! and cancellation, transcription callbacks, and health checks.

pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
