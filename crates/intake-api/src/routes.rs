//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, per-group rate limits
//! and all endpoint handlers.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use intake_core::error::IntakeError;

use crate::handlers;
use crate::rate_limit::{rate_limit_middleware, RouteLimit};
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Widget origins come from config; unparsable entries are skipped.
    let origins: Vec<HeaderValue> = state
        .config
        .web
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let per_sec = state.config.rate_limit.http_requests_per_sec;
    let limit = |group| RouteLimit::new(state.limiter.clone(), group, per_sec);

    let public_routes = Router::new().route("/health", get(handlers::health));

    let channel_routes = Router::new()
        .route(
            "/channels/telegram/webhook",
            post(handlers::telegram_webhook),
        )
        .route("/channels/web/sessions", post(handlers::create_web_session))
        .route("/channels/web/messages", post(handlers::post_web_message))
        .layer(axum::middleware::from_fn(rate_limit_middleware))
        .layer(axum::Extension(limit("channels")));

    let operator_routes = Router::new()
        .route("/responses", post(handlers::create_response))
        .route("/responses/{id}/pins", post(handlers::issue_pin))
        .route(
            "/interviews/{response_id}/complete",
            post(handlers::complete_interview),
        )
        .route(
            "/interviews/{response_id}/cancel",
            post(handlers::cancel_interview),
        )
        .route("/transcriptions", post(handlers::transcription_result))
        .route(
            "/conversations/{response_id}/messages",
            get(handlers::conversation_messages),
        )
        .layer(axum::middleware::from_fn(rate_limit_middleware))
        .layer(axum::Extension(limit("operator")));

    // SSE stream exempt from rate limiting.
    let stream_routes = Router::new().route(
        "/channels/web/sessions/{token}/stream",
        get(handlers::web_stream),
    );

    public_routes
        .merge(channel_routes)
        .merge(operator_routes)
        .merge(stream_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB global limit
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Serves until `shutdown` flips to true, then drains in-flight requests.
pub async fn start_server(
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), IntakeError> {
    let addr = format!(
        "{}:{}",
        state.config.general.bind_address, state.config.general.port
    );
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| IntakeError::Api(format!("Failed to bind: {}", e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| IntakeError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
