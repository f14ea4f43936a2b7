//! Per-route-group rate limiting middleware.
//!
//! Each route group shares one window keyed by its name in the injected
//! [`RateLimiter`], so webhook bursts cannot starve the operator endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use intake_chat::{Decision, RateLimiter};

/// Limiter binding for one route group.
#[derive(Clone)]
pub struct RouteLimit {
    limiter: Arc<dyn RateLimiter>,
    group: &'static str,
    max_per_sec: u32,
}

impl RouteLimit {
    pub fn new(limiter: Arc<dyn RateLimiter>, group: &'static str, max_per_sec: u32) -> Self {
        Self {
            limiter,
            group,
            max_per_sec,
        }
    }

    fn check(&self) -> Decision {
        let key = format!("http:{}", self.group);
        self.limiter
            .check(&key, self.max_per_sec, Duration::from_secs(1))
    }
}

/// Axum middleware that enforces the rate limit of the enclosing group.
pub async fn rate_limit_middleware(
    Extension(limit): Extension<RouteLimit>,
    req: Request,
    next: Next,
) -> Response {
    match limit.check() {
        Decision::Allowed { .. } => next.run(req).await,
        Decision::Denied { retry_after } => {
            tracing::debug!(group = limit.group, "Route group rate limited");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after.as_secs().max(1).to_string())],
                Json(serde_json::json!({
                    "error": "too_many_requests",
                    "message": "Rate limit exceeded"
                })),
            )
                .into_response()
        }
    }
}
