//! crates/counselor_core/src/domain.rs
//!
//! Defines the pure, core data structures for the training pipeline.
//! These structs are independent of any database or serialization format,
//! except for the wire-facing enums which carry serde attributes so every
//! boundary agrees on the same kebab-case spelling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Raised when a string from storage or a caller is not a member of one of
/// the closed enumerations below. Validation happens once, at the boundary.
#[derive(Debug, thiserror::Error)]
#[error("'{value}' is not a valid {kind}")]
pub struct InvalidEnumValue {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str` / `FromStr` / `Display` for a closed string-backed enum.
macro_rules! closed_enum_str {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = InvalidEnumValue;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(InvalidEnumValue {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

//=========================================================================================
// Session
//=========================================================================================

/// How the trainee converses with the simulated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Modality {
    Voice,
    Text,
}
closed_enum_str!(Modality, "modality", { Voice => "voice", Text => "text" });

/// Session status. `Active -> Completed` is the only transition; it is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    Completed,
}
closed_enum_str!(SessionStatus, "session status", { Active => "active", Completed => "completed" });

/// One simulated conversation lifecycle.
///
/// `current_attempt` only increases; at most one attempt is live at a time.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub scenario_id: Option<Uuid>,
    pub modality: Modality,
    pub status: SessionStatus,
    pub current_attempt: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

//=========================================================================================
// Transcript
//=========================================================================================

/// Who produced a turn: the trainee or the simulated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnRole {
    User,
    Assistant,
}
closed_enum_str!(TurnRole, "turn role", { User => "user", Assistant => "assistant" });

/// One stored utterance within one attempt of a session.
/// `(session_id, attempt_number, turn_order)` is unique.
#[derive(Debug, Clone)]
pub struct TranscriptTurn {
    pub session_id: Uuid,
    pub attempt_number: i32,
    pub turn_order: i32,
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Evaluation
//=========================================================================================

/// The persisted scoring result. At most one exists per session.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub overall_score: f64,
    pub strengths: Vec<String>,
    pub areas_to_improve: Vec<String>,
    pub narrative: String,
    pub created_at: DateTime<Utc>,
}

/// What the scoring service returns before anything is persisted.
#[derive(Debug, Clone)]
pub struct ScoredEvaluation {
    pub overall_score: f64,
    pub strengths: Vec<String>,
    pub areas_to_improve: Vec<String>,
    pub narrative: String,
    /// Safety/consistency findings the scorer surfaced alongside the score.
    pub findings: Vec<AnalysisFinding>,
}

/// A single classification finding from the scorer or the analysis scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFinding {
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub details: Option<String>,
}

//=========================================================================================
// Flags
//=========================================================================================

/// The closed set of governance findings a session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagType {
    Jailbreak,
    Inappropriate,
    OffTopic,
    PiiSharing,
    SystemGaming,
    RoleConfusion,
    PromptLeakage,
    CharacterBreak,
    BehaviorOmission,
    UnauthorizedElements,
    DifficultyMismatch,
    CleanAudit,
    UserFeedback,
}
closed_enum_str!(FlagType, "flag type", {
    Jailbreak => "jailbreak",
    Inappropriate => "inappropriate",
    OffTopic => "off-topic",
    PiiSharing => "pii-sharing",
    SystemGaming => "system-gaming",
    RoleConfusion => "role-confusion",
    PromptLeakage => "prompt-leakage",
    CharacterBreak => "character-break",
    BehaviorOmission => "behavior-omission",
    UnauthorizedElements => "unauthorized-elements",
    DifficultyMismatch => "difficulty-mismatch",
    CleanAudit => "clean-audit",
    UserFeedback => "user-feedback",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagSeverity {
    Info,
    Warning,
    Critical,
}
closed_enum_str!(FlagSeverity, "flag severity", {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

/// Which layer produced a flag. The evaluator and the analysis scanner are
/// deliberately redundant detectors over the same transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagSource {
    Evaluation,
    Analysis,
    UserFeedback,
}
closed_enum_str!(FlagSource, "flag source", {
    Evaluation => "evaluation",
    Analysis => "analysis",
    UserFeedback => "user-feedback",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlagStatus {
    Pending,
    Reviewed,
    Dismissed,
}
closed_enum_str!(FlagStatus, "flag status", {
    Pending => "pending",
    Reviewed => "reviewed",
    Dismissed => "dismissed",
});

/// A governance finding attached to a session. Never auto-deleted; reviewed
/// through a separate supervisor surface.
#[derive(Debug, Clone)]
pub struct SessionFlag {
    pub id: Uuid,
    pub session_id: Uuid,
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub source: FlagSource,
    pub status: FlagStatus,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A flag joined with just enough session context for the supervisor list view.
#[derive(Debug, Clone)]
pub struct FlagWithSession {
    pub flag: SessionFlag,
    pub session_user_id: Uuid,
    pub session_modality: Modality,
    pub session_started_at: DateTime<Utc>,
}

//=========================================================================================
// User feedback
//=========================================================================================

/// What a trainee can report about a finished session. Stored flags keep
/// `FlagType::UserFeedback`; the category rides along in the details text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackCategory {
    AiGuidanceConcern,
    ScenarioQuality,
    TechnicalIssue,
    Other,
}
closed_enum_str!(FeedbackCategory, "feedback category", {
    AiGuidanceConcern => "ai-guidance-concern",
    ScenarioQuality => "scenario-quality",
    TechnicalIssue => "technical-issue",
    Other => "other",
});

impl FeedbackCategory {
    /// Severity the stored flag will carry. A concern about the AI's guidance
    /// is always escalated to critical regardless of what the caller asked for.
    pub fn effective_severity(&self, requested: FlagSeverity) -> FlagSeverity {
        match self {
            FeedbackCategory::AiGuidanceConcern => FlagSeverity::Critical,
            _ => requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_type_round_trips_through_strings() {
        for flag_type in [
            FlagType::Jailbreak,
            FlagType::PiiSharing,
            FlagType::UnauthorizedElements,
            FlagType::CleanAudit,
            FlagType::UserFeedback,
        ] {
            let parsed: FlagType = flag_type.as_str().parse().unwrap();
            assert_eq!(parsed, flag_type);
        }
    }

    #[test]
    fn unknown_flag_type_is_rejected() {
        assert!("totally-made-up".parse::<FlagType>().is_err());
    }

    #[test]
    fn ai_guidance_concern_is_forced_critical() {
        let severity =
            FeedbackCategory::AiGuidanceConcern.effective_severity(FlagSeverity::Info);
        assert_eq!(severity, FlagSeverity::Critical);
    }

    #[test]
    fn other_feedback_keeps_requested_severity() {
        let severity = FeedbackCategory::ScenarioQuality.effective_severity(FlagSeverity::Info);
        assert_eq!(severity, FlagSeverity::Info);
    }
}
