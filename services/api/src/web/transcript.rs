//! services/api/src/web/transcript.rs
//!
//! The shared write path both capture-relay writers use: validate the payload
//! before touching storage, log order gaps as a signal, then run the store's
//! idempotent replace protocol.

use crate::error::ApiError;
use counselor_core::ports::DatabaseService;
use counselor_core::transcript::{has_order_gaps, validate_turns, NewTurn, ReplaceOutcome};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Replaces the stored turn set for `(session_id, attempt_number)`.
///
/// A payload shorter than what is already stored is acknowledged but ignored
/// (`IgnoredShorter`), never an error: the other writer had the more complete
/// view. Oversized or malformed payloads are rejected before any storage call.
pub async fn replace_transcript(
    db: &Arc<dyn DatabaseService>,
    session_id: Uuid,
    attempt_number: i32,
    turns: &[NewTurn],
) -> Result<ReplaceOutcome, ApiError> {
    validate_turns(turns)?;

    if attempt_number < 1 {
        return Err(ApiError::InvalidPayload(format!(
            "attempt number {} is not valid, attempts start at 1",
            attempt_number
        )));
    }

    // The session must exist; writers cannot invent sessions.
    db.get_session_by_id(session_id).await?;

    if has_order_gaps(turns) {
        // A signal, not a hard error: the live channel can drop messages.
        warn!(
            %session_id,
            attempt_number,
            turn_count = turns.len(),
            "turn orders are not contiguous, a writer may have missed events"
        );
    }

    let outcome = db.replace_turns(session_id, attempt_number, turns).await?;
    match outcome {
        ReplaceOutcome::Written(written) => {
            info!(%session_id, attempt_number, written, "transcript replaced");
        }
        ReplaceOutcome::IgnoredShorter { stored } => {
            info!(
                %session_id,
                attempt_number,
                incoming = turns.len(),
                stored,
                "shorter flush ignored, keeping the longer stored transcript"
            );
        }
    }
    Ok(outcome)
}
