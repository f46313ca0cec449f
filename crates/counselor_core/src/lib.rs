pub mod domain;
pub mod ports;
pub mod transcript;

pub use domain::{
    AnalysisFinding, Evaluation, FeedbackCategory, FlagSeverity, FlagSource, FlagStatus,
    FlagType, FlagWithSession, Modality, ScoredEvaluation, Session, SessionFlag,
    SessionStatus, TranscriptTurn, TurnRole,
};
pub use ports::{
    AnalysisService, DatabaseService, NewEvaluation, NewFlag, PortError, PortResult,
    ScoringService,
};
pub use transcript::{
    has_order_gaps, validate_turns, NewTurn, ReplaceOutcome, TurnBuffer,
    TurnValidationError, MAX_TURNS_PER_FLUSH, MAX_TURN_CONTENT_CHARS,
};
