//! crates/counselor_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases or APIs.

use crate::domain::{
    AnalysisFinding, Evaluation, FlagSeverity, FlagSource, FlagStatus, FlagType,
    FlagWithSession, Modality, ScoredEvaluation, Session, SessionFlag, TranscriptTurn,
};
use crate::transcript::{NewTurn, ReplaceOutcome};
use async_trait::async_trait;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database,
/// inference) while preserving the failure classes the pipeline must tell apart:
/// a conflict is permanent, a timeout is transient, a refusal needs its own
/// user-facing message.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("The inference service refused the request: {0}")]
    Refused(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Malformed upstream output: {0}")]
    Malformed(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

/// Fields needed to persist a new evaluation row.
#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub session_id: Uuid,
    pub overall_score: f64,
    pub strengths: Vec<String>,
    pub areas_to_improve: Vec<String>,
    pub narrative: String,
}

/// Fields needed to persist a new session flag.
#[derive(Debug, Clone)]
pub struct NewFlag {
    pub session_id: Uuid,
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub source: FlagSource,
    pub details: Option<String>,
}

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- User Management ---
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<Uuid>;

    // --- Session Lifecycle ---
    async fn create_session(
        &self,
        user_id: Uuid,
        scenario_id: Option<Uuid>,
        modality: Modality,
    ) -> PortResult<Session>;

    async fn get_session_by_id(&self, session_id: Uuid) -> PortResult<Session>;

    /// Atomically bumps `current_attempt` and returns the new attempt number.
    /// Fails with `Conflict` if the session is no longer active. Implemented
    /// as a conditional update, never read-then-write.
    async fn increment_attempt(&self, session_id: Uuid) -> PortResult<i32>;

    /// Flips status to `completed`. Idempotent: completing an already
    /// completed session is a no-op. Concurrent callers converge on the same
    /// terminal state.
    async fn complete_session(&self, session_id: Uuid) -> PortResult<()>;

    // --- Transcript Store ---
    /// The idempotent replace protocol: in one transaction, compare the
    /// incoming set's length against the stored count for
    /// `(session_id, attempt_number)`; if strictly shorter, leave storage
    /// untouched and report `IgnoredShorter`; otherwise delete all stored
    /// turns for the attempt and bulk-insert the incoming set. A storage
    /// failure aborts the whole write, never a partial replace.
    ///
    /// The caller is responsible for validating payload bounds first via
    /// `transcript::validate_turns`.
    async fn replace_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
        turns: &[NewTurn],
    ) -> PortResult<ReplaceOutcome>;

    async fn get_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
    ) -> PortResult<Vec<TranscriptTurn>>;

    async fn count_turns(&self, session_id: Uuid, attempt_number: i32) -> PortResult<usize>;

    // --- Evaluation Store ---
    async fn get_evaluation_by_session(&self, session_id: Uuid)
        -> PortResult<Option<Evaluation>>;

    /// Inserts the single evaluation row for a session. A second insert for
    /// the same session must surface as `PortError::Conflict` (backed by the
    /// unique constraint on `session_id`), so the orchestrator can return the
    /// winner's record to the losing caller.
    async fn insert_evaluation(&self, evaluation: NewEvaluation) -> PortResult<Evaluation>;

    // --- Flag Store ---
    async fn insert_flag(&self, flag: NewFlag) -> PortResult<SessionFlag>;

    /// True when at least one flag with the given source exists for the
    /// session. The analysis scanner uses this as its idempotency check.
    async fn has_flag_from_source(&self, session_id: Uuid, source: FlagSource)
        -> PortResult<bool>;

    /// Lists flags for supervisor review, ordered critical-first and then
    /// newest-first, with minimal session context attached.
    async fn list_flags(
        &self,
        status: Option<FlagStatus>,
        severity: Option<FlagSeverity>,
    ) -> PortResult<Vec<FlagWithSession>>;

    // --- Scenario Store (read-only, external collaborator) ---
    /// Looks up the scenario prompt text used to enrich scoring and analysis.
    /// Returns `None` when the scenario does not exist or carries no prompt;
    /// callers degrade to generic criteria.
    async fn get_scenario_prompt(&self, scenario_id: Uuid) -> PortResult<Option<String>>;
}

#[async_trait]
pub trait ScoringService: Send + Sync {
    /// Scores a finished transcript, optionally enriched with the scenario
    /// prompt context. Refusals, timeouts, and malformed output map to the
    /// corresponding `PortError` variants.
    async fn score_transcript(
        &self,
        turns: &[TranscriptTurn],
        scenario_prompt: Option<&str>,
    ) -> PortResult<ScoredEvaluation>;
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Runs one combined misuse + consistency classification pass over the
    /// transcript, requesting a schema-constrained structured result.
    /// Consistency categories are only evaluated when a scenario prompt is
    /// present.
    async fn classify_transcript(
        &self,
        turns: &[TranscriptTurn],
        scenario_prompt: Option<&str>,
    ) -> PortResult<Vec<AnalysisFinding>>;
}
