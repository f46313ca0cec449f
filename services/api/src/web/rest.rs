//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::ApiError;
use crate::web::evaluation::request_evaluation;
use crate::web::state::AppState;
use crate::web::transcript::replace_transcript;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use counselor_core::domain::{
    Evaluation, FeedbackCategory, FlagSeverity, FlagSource, FlagStatus, FlagType,
    FlagWithSession, Modality,
};
use counselor_core::ports::NewFlag;
use counselor_core::transcript::NewTurn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        start_session_handler,
        increment_attempt_handler,
        replace_transcript_handler,
        request_evaluation_handler,
        submit_feedback_handler,
        list_flags_handler,
    ),
    components(
        schemas(
            StartSessionRequest,
            StartSessionResponse,
            AttemptResponse,
            ReplaceTranscriptRequest,
            TurnPayload,
            ReplaceTranscriptResponse,
            EvaluationResponse,
            FeedbackRequest,
            FlagResponse,
        )
    ),
    tags(
        (name = "Counselor Training API", description = "Session transcript pipeline: capture, reconciliation, scoring, and audit.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct StartSessionRequest {
    /// Optional scenario the caller agent will act out.
    pub scenario_id: Option<Uuid>,
    /// `voice` or `text`.
    pub modality: String,
}

#[derive(Serialize, ToSchema)]
pub struct StartSessionResponse {
    session_id: Uuid,
    user_id: Uuid,
    attempt_number: i32,
    modality: String,
    status: String,
}

#[derive(Serialize, ToSchema)]
pub struct AttemptResponse {
    session_id: Uuid,
    attempt_number: i32,
}

#[derive(Deserialize, ToSchema)]
pub struct ReplaceTranscriptRequest {
    pub attempt_number: i32,
    pub turns: Vec<TurnPayload>,
}

/// One turn as submitted by either writer.
#[derive(Deserialize, ToSchema)]
pub struct TurnPayload {
    /// `user` (trainee) or `assistant` (simulated caller).
    pub role: String,
    pub content: String,
    pub turn_order: i32,
}

#[derive(Serialize, ToSchema)]
pub struct ReplaceTranscriptResponse {
    /// Number of turns written. Zero when the payload was ignored.
    written: usize,
    /// True when a shorter payload was dropped in favor of the longer stored
    /// transcript. This is a normal outcome, not an error.
    ignored: bool,
}

#[derive(Serialize, ToSchema)]
pub struct EvaluationResponse {
    id: Uuid,
    session_id: Uuid,
    overall_score: f64,
    strengths: Vec<String>,
    areas_to_improve: Vec<String>,
    narrative: String,
    created_at: DateTime<Utc>,
}

impl From<Evaluation> for EvaluationResponse {
    fn from(evaluation: Evaluation) -> Self {
        Self {
            id: evaluation.id,
            session_id: evaluation.session_id,
            overall_score: evaluation.overall_score,
            strengths: evaluation.strengths,
            areas_to_improve: evaluation.areas_to_improve,
            narrative: evaluation.narrative,
            created_at: evaluation.created_at,
        }
    }
}

#[derive(Deserialize, ToSchema)]
pub struct FeedbackRequest {
    /// One of `ai-guidance-concern`, `scenario-quality`, `technical-issue`, `other`.
    pub category: String,
    /// Requested severity; `ai-guidance-concern` is always escalated to critical.
    pub severity: Option<String>,
    pub details: String,
}

#[derive(Serialize, ToSchema)]
pub struct FlagResponse {
    id: Uuid,
    session_id: Uuid,
    flag_type: String,
    severity: String,
    source: String,
    status: String,
    details: Option<String>,
    created_at: DateTime<Utc>,
    session_user_id: Option<Uuid>,
    session_modality: Option<String>,
    session_started_at: Option<DateTime<Utc>>,
}

impl From<FlagWithSession> for FlagResponse {
    fn from(f: FlagWithSession) -> Self {
        Self {
            id: f.flag.id,
            session_id: f.flag.session_id,
            flag_type: f.flag.flag_type.as_str().to_string(),
            severity: f.flag.severity.as_str().to_string(),
            source: f.flag.source.as_str().to_string(),
            status: f.flag.status.as_str().to_string(),
            details: f.flag.details,
            created_at: f.flag.created_at,
            session_user_id: Some(f.session_user_id),
            session_modality: Some(f.session_modality.as_str().to_string()),
            session_started_at: Some(f.session_started_at),
        }
    }
}

#[derive(Deserialize)]
pub struct ListFlagsQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
}

fn parse_param<T>(raw: &str, what: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ApiError::InvalidPayload(format!("invalid {what}: {e}")))
}

fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("x-user-id header is required".to_string()))?;
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::InvalidPayload("Invalid x-user-id format".to_string()))
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Start a new training session.
///
/// Creates an `active` session at attempt 1, owned by the user in the
/// `x-user-id` header.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session created", body = StartSessionResponse),
        (status = 400, description = "Bad request (e.g., missing header or bad modality)")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn start_session_handler(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = user_id_from_headers(&headers)?;
    let modality: Modality = parse_param(&payload.modality, "modality")?;

    app_state.db.get_or_create_user(user_id).await?;
    let session = app_state
        .db
        .create_session(user_id, payload.scenario_id, modality)
        .await?;

    let response = StartSessionResponse {
        session_id: session.id,
        user_id: session.user_id,
        attempt_number: session.current_attempt,
        modality: session.modality.as_str().to_string(),
        status: session.status.as_str().to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// Start a fresh attempt on an existing session.
///
/// Atomically bumps the attempt counter; fails with 409 if the session is no
/// longer active.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/attempts",
    responses(
        (status = 200, description = "Attempt incremented", body = AttemptResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session is not active")
    ),
    params(
        ("session_id" = Uuid, Path, description = "The session to restart practice on.")
    )
)]
pub async fn increment_attempt_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let attempt_number = app_state.db.increment_attempt(session_id).await?;
    Ok(Json(AttemptResponse {
        session_id,
        attempt_number,
    }))
}

/// Replace the stored transcript for one attempt.
///
/// Used by both capture-relay writers. The whole turn set is replaced
/// atomically; a payload shorter than what is already stored is acknowledged
/// but ignored so a partial flush never destroys a more complete one.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/transcript",
    request_body = ReplaceTranscriptRequest,
    responses(
        (status = 200, description = "Transcript written or shorter payload ignored", body = ReplaceTranscriptResponse),
        (status = 400, description = "Payload failed validation (caps: 200 turns, 5000 chars/turn)"),
        (status = 404, description = "Session not found")
    ),
    params(
        ("session_id" = Uuid, Path, description = "The session the turns belong to.")
    )
)]
pub async fn replace_transcript_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ReplaceTranscriptRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let turns = payload
        .turns
        .into_iter()
        .map(|t| {
            Ok(NewTurn {
                role: parse_param(&t.role, "turn role")?,
                content: t.content,
                turn_order: t.turn_order,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let outcome =
        replace_transcript(&app_state.db, session_id, payload.attempt_number, &turns).await?;

    Ok(Json(ReplaceTranscriptResponse {
        written: outcome.written(),
        ignored: outcome.written() == 0 && !turns.is_empty(),
    }))
}

/// Request the session's evaluation.
///
/// Idempotent: an existing evaluation is returned unchanged. A 425 means the
/// transcript is not ready yet and the caller should retry shortly; a 409
/// means no retry can ever succeed.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/evaluation",
    responses(
        (status = 200, description = "Evaluation (new or existing)", body = EvaluationResponse),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Evaluation can never succeed for this session"),
        (status = 422, description = "The scoring service refused this content"),
        (status = 425, description = "Transcript not ready yet, retry shortly")
    ),
    params(
        ("session_id" = Uuid, Path, description = "The session to evaluate.")
    )
)]
pub async fn request_evaluation_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let evaluation = request_evaluation(
        &app_state.db,
        &app_state.scoring_adapter,
        &app_state.analysis_queue,
        app_state.config.inference_timeout,
        session_id,
    )
    .await?;
    Ok(Json(EvaluationResponse::from(evaluation)))
}

/// Submit trainee feedback about a session.
///
/// Stored as a flag with `source=user-feedback`. An `ai-guidance-concern`
/// category is force-escalated to critical severity regardless of input.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/feedback",
    request_body = FeedbackRequest,
    responses(
        (status = 201, description = "Feedback recorded", body = FlagResponse),
        (status = 400, description = "Unknown category or severity"),
        (status = 404, description = "Session not found")
    ),
    params(
        ("session_id" = Uuid, Path, description = "The session the feedback is about.")
    )
)]
pub async fn submit_feedback_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let category: FeedbackCategory = parse_param(&payload.category, "feedback category")?;
    let requested = match payload.severity.as_deref() {
        Some(raw) => parse_param::<FlagSeverity>(raw, "severity")?,
        None => FlagSeverity::Info,
    };
    let severity = category.effective_severity(requested);

    // The session must exist before attaching feedback to it.
    app_state.db.get_session_by_id(session_id).await?;

    let flag = app_state
        .db
        .insert_flag(NewFlag {
            session_id,
            flag_type: FlagType::UserFeedback,
            severity,
            source: FlagSource::UserFeedback,
            details: Some(format!("[{}] {}", category.as_str(), payload.details)),
        })
        .await?;

    let response = FlagResponse {
        id: flag.id,
        session_id: flag.session_id,
        flag_type: flag.flag_type.as_str().to_string(),
        severity: flag.severity.as_str().to_string(),
        source: flag.source.as_str().to_string(),
        status: flag.status.as_str().to_string(),
        details: flag.details,
        created_at: flag.created_at,
        session_user_id: None,
        session_modality: None,
        session_started_at: None,
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// List flags for supervisor review.
///
/// Ordered critical-first, then newest-first. Protected by the supervisor
/// token middleware.
#[utoipa::path(
    get,
    path = "/flags",
    responses(
        (status = 200, description = "Flags with minimal session context", body = [FlagResponse]),
        (status = 401, description = "Missing or invalid supervisor token")
    ),
    params(
        ("status" = Option<String>, Query, description = "Filter: pending | reviewed | dismissed"),
        ("severity" = Option<String>, Query, description = "Filter: info | warning | critical")
    )
)]
pub async fn list_flags_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<ListFlagsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| parse_param::<FlagStatus>(raw, "status"))
        .transpose()?;
    let severity = query
        .severity
        .as_deref()
        .map(|raw| parse_param::<FlagSeverity>(raw, "severity"))
        .transpose()?;

    let flags = app_state.db.list_flags(status, severity).await?;
    let response: Vec<FlagResponse> = flags.into_iter().map(FlagResponse::from).collect();
    Ok(Json(response))
}
