//! Route handler implementations for all API endpoints.
//!
//! Each handler extracts parameters from the request, delegates to the
//! conversation pipeline, and returns a JSON response or ApiError.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use intake_channels::telegram::SECRET_HEADER;
use intake_channels::{parse_update, Update, WebInbound};
use intake_chat::{CompletionOutcome, GatewayOutcome, IssuedPin, TranscriptOutcome};
use intake_core::types::{
    CancelReason, CandidateResponse, CompletionReason, Conversation, ConversationMessage,
    ResponseId,
};
use intake_storage::{conversations, outbox, responses};

use crate::error::ApiError;
use crate::state::AppState;

// =============================================================================
// Response types
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Outbox rows not yet handed to the job bus.
    pub outbox_pending: usize,
    pub web_sessions: usize,
    pub telegram_enabled: bool,
}

/// Acknowledgement for an inbound channel message.
///
/// Only the handling kind is reported; conversation identifiers never go
/// back to the participant's transport.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageAck {
    pub ok: bool,
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSessionCreated {
    pub session_token: String,
    pub stream_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub messages: Vec<ConversationMessage>,
}

// =============================================================================
// Request types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponseRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub candidate_name: String,
    pub vacancy_title: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteRequest {
    /// Defaults to `candidate_ended`.
    #[serde(default)]
    pub reason: Option<CompletionReason>,
    /// Overrides the transcript built from the stored conversation.
    #[serde(default)]
    pub transcript: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    /// Defaults to `operator`.
    #[serde(default)]
    pub reason: Option<CancelReason>,
}

/// Callback from the transcription service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionRequest {
    pub message_id: Uuid,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

fn outcome_label(outcome: &GatewayOutcome) -> &'static str {
    match outcome {
        GatewayOutcome::Buffered { .. } => "buffered",
        GatewayOutcome::Identified { .. } => "identified",
        GatewayOutcome::Forwarded { .. } => "forwarded",
        GatewayOutcome::Ended { .. } => "ended",
        GatewayOutcome::Rejected { .. } => "rejected",
        GatewayOutcome::Duplicate => "duplicate",
    }
}

/// Generate a random 32-character hex session token.
fn generate_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - service status and queue depth.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let outbox_pending = state
        .database
        .with_conn(|conn| outbox::pending_count(conn).map_err(ApiError::from))?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        outbox_pending,
        web_sessions: state.web.session_count(),
        telegram_enabled: state.telegram.is_enabled(),
    }))
}

// =============================================================================
// Channels
// =============================================================================

/// POST /channels/telegram/webhook - inbound Telegram update.
pub async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> Result<Json<MessageAck>, ApiError> {
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !state.telegram.verify_secret(secret) {
        tracing::warn!(update_id = update.update_id, "Webhook secret mismatch");
        return Err(ApiError::Unauthorized("invalid webhook secret".to_string()));
    }

    let Some(incoming) = parse_update(&update) else {
        return Ok(Json(MessageAck {
            ok: true,
            outcome: "ignored".to_string(),
        }));
    };

    let outcome = state.gateway.route(incoming).await?;
    Ok(Json(MessageAck {
        ok: true,
        outcome: outcome_label(&outcome).to_string(),
    }))
}

/// POST /channels/web/sessions - open a widget session.
pub async fn create_web_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<WebSessionCreated>) {
    let token = generate_token();
    state.web.register(&token);
    tracing::debug!(sessions = state.web.session_count(), "Web session opened");

    (
        StatusCode::CREATED,
        Json(WebSessionCreated {
            stream_path: format!("/channels/web/sessions/{}/stream", token),
            session_token: token,
        }),
    )
}

/// POST /channels/web/messages - inbound widget message.
pub async fn post_web_message(
    State(state): State<AppState>,
    Json(inbound): Json<WebInbound>,
) -> Result<Json<MessageAck>, ApiError> {
    let incoming = state.web.to_incoming(inbound)?;
    let outcome = state.gateway.route(incoming).await?;
    Ok(Json(MessageAck {
        ok: true,
        outcome: outcome_label(&outcome).to_string(),
    }))
}

/// GET /channels/web/sessions/{token}/stream - SSE stream of bot replies.
pub async fn web_stream(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let rx = state.web.subscribe(&token)?;
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(reply) => {
            let data = serde_json::to_string(&reply).unwrap_or_default();
            Some(Ok(Event::default().event("reply").data(data)))
        }
        // Lagged receivers skip missed replies; the widget reloads history.
        Err(_) => None,
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

// =============================================================================
// Responses and pins
// =============================================================================

/// POST /responses - register a candidate response.
pub async fn create_response(
    State(state): State<AppState>,
    Json(body): Json<CreateResponseRequest>,
) -> Result<(StatusCode, Json<CandidateResponse>), ApiError> {
    if body.candidate_name.trim().is_empty() || body.vacancy_title.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "candidateName and vacancyTitle are required".to_string(),
        ));
    }
    let id = match body.id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("id cannot be empty".to_string()))
        }
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    let response = CandidateResponse {
        id: ResponseId::new(id),
        candidate_name: body.candidate_name,
        vacancy_title: body.vacancy_title,
        created_at: Utc::now(),
    };
    let inserted = state
        .database
        .with_conn(|conn| responses::insert_response(conn, &response).map_err(ApiError::from))?;
    if !inserted {
        return Err(ApiError::Conflict(format!(
            "response {} already exists",
            response.id
        )));
    }

    tracing::info!(response_id = %response.id, "Response registered");
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /responses/{id}/pins - issue an identification pin.
pub async fn issue_pin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<IssuedPin>), ApiError> {
    let issued = state.identity.issue_pin(&ResponseId::new(id), Utc::now())?;
    Ok((StatusCode::CREATED, Json(issued)))
}

// =============================================================================
// Interviews
// =============================================================================

/// POST /interviews/{response_id}/complete - finish an interview.
///
/// Idempotent: repeated calls report `already_completed`.
pub async fn complete_interview(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    let reason = body.reason.unwrap_or(CompletionReason::CandidateEnded);
    let outcome = state.completion.complete(
        &ResponseId::new(response_id),
        reason,
        body.transcript,
        Utc::now(),
    )?;
    Ok(Json(outcome))
}

/// POST /interviews/{response_id}/cancel - cancel an interview.
pub async fn cancel_interview(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    let reason = body.reason.unwrap_or(CancelReason::Operator);
    let outcome = state
        .completion
        .cancel(&ResponseId::new(response_id), reason, Utc::now())?;
    Ok(Json(outcome))
}

// =============================================================================
// Transcription callbacks and history
// =============================================================================

/// POST /transcriptions - result of a `voice.transcribe` job.
pub async fn transcription_result(
    State(state): State<AppState>,
    Json(body): Json<TranscriptionRequest>,
) -> Result<Json<MessageAck>, ApiError> {
    let outcome = match (body.text, body.error) {
        (Some(text), None) if !text.trim().is_empty() => TranscriptOutcome::Transcribed { text },
        (_, Some(error)) => TranscriptOutcome::Failed { error },
        _ => TranscriptOutcome::Failed {
            error: "empty transcript".to_string(),
        },
    };

    let reply = state
        .orchestrator
        .apply_transcript(body.message_id, outcome)
        .await?;
    Ok(Json(MessageAck {
        ok: true,
        outcome: if reply.is_some() { "replied" } else { "stored" }.to_string(),
    }))
}

/// GET /conversations/{response_id}/messages - full conversation history.
pub async fn conversation_messages(
    State(state): State<AppState>,
    Path(response_id): Path<String>,
) -> Result<Json<ConversationView>, ApiError> {
    let response_id = ResponseId::new(response_id);
    let conversation = state
        .database
        .with_conn(|conn| {
            conversations::find_conversation_by_response(conn, &response_id).map_err(ApiError::from)
        })?
        .ok_or_else(|| ApiError::NotFound(format!("no conversation for {}", response_id)))?;

    let messages = state.orchestrator.history(&conversation.id)?;
    Ok(Json(ConversationView {
        conversation,
        messages,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_complete_request_defaults() {
        let body: CompleteRequest = serde_json::from_str("{}").unwrap();
        assert!(body.reason.is_none());
        let body: CompleteRequest =
            serde_json::from_str(r#"{"reason": "timeout", "transcript": "t"}"#).unwrap();
        assert_eq!(body.reason, Some(CompletionReason::Timeout));
        assert_eq!(body.transcript.as_deref(), Some("t"));
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&GatewayOutcome::Duplicate), "duplicate");
        assert_eq!(
            outcome_label(&GatewayOutcome::Rejected {
                reply: intake_chat::ScriptedReply::NotRecognized
            }),
            "rejected"
        );
    }
}
