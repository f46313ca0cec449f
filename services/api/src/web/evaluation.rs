//! services/api/src/web/evaluation.rs
//!
//! The evaluation orchestrator: turns a "ready enough" transcript into the
//! session's single Evaluation row, with idempotent creation, transient vs.
//! permanent failure signaling, and the fire-and-forget hand-off to the
//! post-session analysis worker.

use crate::error::ApiError;
use crate::web::analysis_task::{AnalysisJob, AnalysisQueue};
use counselor_core::domain::{Evaluation, FlagSource, SessionStatus};
use counselor_core::ports::{DatabaseService, NewEvaluation, NewFlag, PortError, ScoringService};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Minimum number of stored turns before a transcript counts as a real exchange.
const MIN_TURNS_FOR_EVALUATION: usize = 2;

/// Requests (or returns the existing) evaluation for a session.
///
/// Outcomes the caller can distinguish by status code:
/// - the existing evaluation, unchanged, when one already exists;
/// - 425 when the transcript is too short but the session is still active
///   (the other writer may not have flushed yet — retry shortly);
/// - 409 when the session is completed without a usable transcript, so no
///   retry can ever succeed.
pub async fn request_evaluation(
    db: &Arc<dyn DatabaseService>,
    scorer: &Arc<dyn ScoringService>,
    analysis_queue: &AnalysisQueue,
    inference_timeout: Duration,
    session_id: Uuid,
) -> Result<Evaluation, ApiError> {
    // 1. Idempotency: a retried request finds the existing row and returns it.
    if let Some(existing) = db.get_evaluation_by_session(session_id).await? {
        info!(%session_id, "evaluation already exists, returning it unchanged");
        return Ok(existing);
    }

    let session = db.get_session_by_id(session_id).await?;

    // 2. Readiness: fewer than two turns is not a real exchange.
    let turns = db.get_turns(session_id, session.current_attempt).await?;
    if turns.len() < MIN_TURNS_FOR_EVALUATION {
        return match session.status {
            SessionStatus::Active => Err(ApiError::TranscriptNotReady),
            // Writers are done; the count will never grow.
            SessionStatus::Completed => Err(ApiError::EvaluationConflict(format!(
                "session {} was completed without a usable transcript",
                session_id
            ))),
        };
    }

    // 3. Scenario context enriches scoring but its absence degrades gracefully.
    let scenario_prompt = match session.scenario_id {
        Some(scenario_id) => match db.get_scenario_prompt(scenario_id).await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(%session_id, "scenario lookup failed, scoring with generic criteria: {e}");
                None
            }
        },
        None => None,
    };

    let scored = tokio::time::timeout(
        inference_timeout,
        scorer.score_transcript(&turns, scenario_prompt.as_deref()),
    )
    .await
    .map_err(|_| {
        PortError::Timeout(format!(
            "scoring did not finish within {}s",
            inference_timeout.as_secs()
        ))
    })?
    .map_err(|e| match e {
        PortError::Refused(_) => ApiError::ScoringRefused,
        other => ApiError::Port(other),
    })?;

    // 4. Insert, handling the duplicate-create race: if a concurrent request
    //    won, the unique constraint rejects this insert and we return the
    //    winner's record instead of an error.
    let evaluation = match db
        .insert_evaluation(NewEvaluation {
            session_id,
            overall_score: scored.overall_score,
            strengths: scored.strengths,
            areas_to_improve: scored.areas_to_improve,
            narrative: scored.narrative,
        })
        .await
    {
        Ok(evaluation) => evaluation,
        Err(PortError::Conflict(_)) => {
            info!(%session_id, "lost the evaluation insert race, returning the winner's record");
            return db
                .get_evaluation_by_session(session_id)
                .await?
                .ok_or_else(|| {
                    ApiError::Internal(format!(
                        "evaluation insert conflicted but no row exists for session {}",
                        session_id
                    ))
                });
        }
        Err(e) => return Err(e.into()),
    };

    // Evaluator-derived flags are best-effort: the evaluation is already
    // persisted and the analysis scanner provides redundant coverage.
    for finding in scored.findings {
        let result = db
            .insert_flag(NewFlag {
                session_id,
                flag_type: finding.flag_type,
                severity: finding.severity,
                source: FlagSource::Evaluation,
                details: finding.details,
            })
            .await;
        if let Err(e) = result {
            error!(%session_id, "failed to persist an evaluator finding: {e}");
        }
    }

    // First successful evaluation request completes the session.
    db.complete_session(session_id).await?;

    // 5. Hand the analysis pass to the background worker without blocking the
    //    response. A full or closed queue is logged, never surfaced.
    if let Err(e) = analysis_queue.try_send(AnalysisJob { session_id }) {
        error!(%session_id, "failed to enqueue post-session analysis: {e}");
    }

    Ok(evaluation)
}

//=========================================================================================
// Bounded evaluation polling
//=========================================================================================

/// The client-facing retry contract: a fixed delay between attempts and a
/// hard attempt cap, retrying only while failures are transient.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Outcome of a bounded polling loop.
#[derive(Debug)]
pub enum PollOutcome {
    Completed(Evaluation),
    /// The retry budget ran out; carries the last transient error's message.
    GaveUp { last_error: String },
    Cancelled,
}

/// Polls `fetch` until it succeeds, fails permanently, exhausts the attempt
/// budget, or the owning context is torn down. Each writer's "finish" path
/// uses this same loop.
pub async fn poll_evaluation<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<PollOutcome, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Evaluation, ApiError>>,
{
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Ok(PollOutcome::Cancelled);
        }
        match fetch().await {
            Ok(evaluation) => return Ok(PollOutcome::Completed(evaluation)),
            Err(e) if e.is_transient() => {
                info!("evaluation not ready (attempt {attempt}/{}): {e}", policy.max_attempts);
                last_error = e.to_string();
            }
            // Permanent failures stop the loop immediately.
            Err(e) => return Err(e),
        }
        if attempt < policy.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }
    }
    Ok(PollOutcome::GaveUp { last_error })
}
