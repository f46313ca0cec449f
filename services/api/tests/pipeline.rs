//! Integration tests for the transcript pipeline: the reconciliation gate,
//! the evaluation orchestrator, the analysis scanner, and the bounded
//! polling loop, all run against in-memory implementations of the ports.

use api_lib::error::ApiError;
use api_lib::web::analysis_task::{
    analyze_session, AnalysisJob, AnalysisOutcome, SkipReason,
};
use api_lib::web::evaluation::{poll_evaluation, request_evaluation, PollOutcome, RetryPolicy};
use api_lib::web::transcript::replace_transcript;
use async_trait::async_trait;
use chrono::Utc;
use counselor_core::domain::{
    AnalysisFinding, Evaluation, FlagSeverity, FlagSource, FlagStatus, FlagType,
    FlagWithSession, Modality, ScoredEvaluation, Session, SessionFlag, SessionStatus,
    TranscriptTurn, TurnRole,
};
use counselor_core::ports::{
    AnalysisService, DatabaseService, NewEvaluation, NewFlag, PortError, PortResult,
    ScoringService,
};
use counselor_core::transcript::{NewTurn, ReplaceOutcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

//=========================================================================================
// In-memory DatabaseService
//=========================================================================================

#[derive(Default)]
struct Inner {
    sessions: HashMap<Uuid, Session>,
    turns: HashMap<(Uuid, i32), Vec<TranscriptTurn>>,
    evaluations: HashMap<Uuid, Evaluation>,
    flags: Vec<SessionFlag>,
    scenarios: HashMap<Uuid, Option<String>>,
}

#[derive(Default)]
struct MemoryDb {
    inner: Mutex<Inner>,
}

impl MemoryDb {
    fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DatabaseService for MemoryDb {
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<Uuid> {
        Ok(user_id)
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        scenario_id: Option<Uuid>,
        modality: Modality,
    ) -> PortResult<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            scenario_id,
            modality,
            status: SessionStatus::Active,
            current_attempt: 1,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn get_session_by_id(&self, session_id: Uuid) -> PortResult<Session> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))
    }

    async fn increment_attempt(&self, session_id: Uuid) -> PortResult<i32> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))?;
        if session.status != SessionStatus::Active {
            return Err(PortError::Conflict(format!(
                "Session {} is not active",
                session_id
            )));
        }
        session.current_attempt += 1;
        Ok(session.current_attempt)
    }

    async fn complete_session(&self, session_id: Uuid) -> PortResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| PortError::NotFound(format!("Session {} not found", session_id)))?;
        if session.status == SessionStatus::Active {
            session.status = SessionStatus::Completed;
            session.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn replace_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
        turns: &[NewTurn],
    ) -> PortResult<ReplaceOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let key = (session_id, attempt_number);
        let stored = inner.turns.get(&key).map(Vec::len).unwrap_or(0);
        if turns.len() < stored {
            return Ok(ReplaceOutcome::IgnoredShorter { stored });
        }
        let rows: Vec<TranscriptTurn> = turns
            .iter()
            .map(|t| TranscriptTurn {
                session_id,
                attempt_number,
                turn_order: t.turn_order,
                role: t.role,
                content: t.content.clone(),
                created_at: Utc::now(),
            })
            .collect();
        inner.turns.insert(key, rows);
        Ok(ReplaceOutcome::Written(turns.len()))
    }

    async fn get_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
    ) -> PortResult<Vec<TranscriptTurn>> {
        let inner = self.inner.lock().unwrap();
        let mut turns = inner
            .turns
            .get(&(session_id, attempt_number))
            .cloned()
            .unwrap_or_default();
        turns.sort_by_key(|t| t.turn_order);
        Ok(turns)
    }

    async fn count_turns(&self, session_id: Uuid, attempt_number: i32) -> PortResult<usize> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .turns
            .get(&(session_id, attempt_number))
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn get_evaluation_by_session(
        &self,
        session_id: Uuid,
    ) -> PortResult<Option<Evaluation>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .evaluations
            .get(&session_id)
            .cloned())
    }

    async fn insert_evaluation(&self, evaluation: NewEvaluation) -> PortResult<Evaluation> {
        let mut inner = self.inner.lock().unwrap();
        if inner.evaluations.contains_key(&evaluation.session_id) {
            return Err(PortError::Conflict(format!(
                "Evaluation already exists for session {}",
                evaluation.session_id
            )));
        }
        let row = Evaluation {
            id: Uuid::new_v4(),
            session_id: evaluation.session_id,
            overall_score: evaluation.overall_score,
            strengths: evaluation.strengths,
            areas_to_improve: evaluation.areas_to_improve,
            narrative: evaluation.narrative,
            created_at: Utc::now(),
        };
        inner.evaluations.insert(row.session_id, row.clone());
        Ok(row)
    }

    async fn insert_flag(&self, flag: NewFlag) -> PortResult<SessionFlag> {
        let row = SessionFlag {
            id: Uuid::new_v4(),
            session_id: flag.session_id,
            flag_type: flag.flag_type,
            severity: flag.severity,
            source: flag.source,
            status: FlagStatus::Pending,
            details: flag.details,
            created_at: Utc::now(),
        };
        self.inner.lock().unwrap().flags.push(row.clone());
        Ok(row)
    }

    async fn has_flag_from_source(
        &self,
        session_id: Uuid,
        source: FlagSource,
    ) -> PortResult<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .flags
            .iter()
            .any(|f| f.session_id == session_id && f.source == source))
    }

    async fn list_flags(
        &self,
        status: Option<FlagStatus>,
        severity: Option<FlagSeverity>,
    ) -> PortResult<Vec<FlagWithSession>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<FlagWithSession> = inner
            .flags
            .iter()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .filter(|f| severity.map_or(true, |s| f.severity == s))
            .filter_map(|f| {
                inner.sessions.get(&f.session_id).map(|s| FlagWithSession {
                    flag: f.clone(),
                    session_user_id: s.user_id,
                    session_modality: s.modality,
                    session_started_at: s.started_at,
                })
            })
            .collect();
        // Same contract as the SQL adapter: critical first, then newest first.
        let rank = |s: FlagSeverity| match s {
            FlagSeverity::Critical => 0,
            FlagSeverity::Warning => 1,
            FlagSeverity::Info => 2,
        };
        rows.sort_by(|a, b| {
            rank(a.flag.severity)
                .cmp(&rank(b.flag.severity))
                .then(b.flag.created_at.cmp(&a.flag.created_at))
        });
        Ok(rows)
    }

    async fn get_scenario_prompt(&self, scenario_id: Uuid) -> PortResult<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .scenarios
            .get(&scenario_id)
            .cloned()
            .flatten())
    }
}

//=========================================================================================
// Inference service doubles
//=========================================================================================

struct MockScorer {
    calls: AtomicUsize,
    findings: Vec<AnalysisFinding>,
    fail_with: Option<fn() -> PortError>,
    /// Delay before answering, so concurrent callers all pass the
    /// orchestrator's idempotency check before any insert happens.
    delay: Duration,
}

impl MockScorer {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            findings: Vec::new(),
            fail_with: None,
            delay: Duration::ZERO,
        }
    }

    fn with_findings(mut self, findings: Vec<AnalysisFinding>) -> Self {
        self.findings = findings;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self, f: fn() -> PortError) -> Self {
        self.fail_with = Some(f);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoringService for MockScorer {
    async fn score_transcript(
        &self,
        _turns: &[TranscriptTurn],
        scenario_prompt: Option<&str>,
    ) -> PortResult<ScoredEvaluation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(fail) = self.fail_with {
            return Err(fail());
        }
        Ok(ScoredEvaluation {
            overall_score: 78.0,
            strengths: vec!["stayed calm".to_string()],
            areas_to_improve: vec!["ask about safety sooner".to_string()],
            narrative: match scenario_prompt {
                Some(_) => "Scored against the scenario brief.".to_string(),
                None => "Scored with generic criteria.".to_string(),
            },
            findings: self.findings.clone(),
        })
    }
}

struct MockAnalyzer {
    calls: AtomicUsize,
    findings: Vec<AnalysisFinding>,
    fail: bool,
}

impl MockAnalyzer {
    fn new(findings: Vec<AnalysisFinding>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            findings,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            findings: Vec::new(),
            fail: true,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisService for MockAnalyzer {
    async fn classify_transcript(
        &self,
        _turns: &[TranscriptTurn],
        _scenario_prompt: Option<&str>,
    ) -> PortResult<Vec<AnalysisFinding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(PortError::Malformed(
                "analysis output did not match the schema".to_string(),
            ));
        }
        Ok(self.findings.clone())
    }
}

//=========================================================================================
// Helpers
//=========================================================================================

const INFERENCE_TIMEOUT: Duration = Duration::from_secs(30);

fn turn(order: i32, content: &str) -> NewTurn {
    NewTurn {
        role: if order % 2 == 0 {
            TurnRole::User
        } else {
            TurnRole::Assistant
        },
        content: content.to_string(),
        turn_order: order,
    }
}

fn turns(count: i32) -> Vec<NewTurn> {
    (0..count).map(|i| turn(i, &format!("turn {i}"))).collect()
}

async fn seed_session(db: &Arc<dyn DatabaseService>) -> Session {
    db.create_session(Uuid::new_v4(), None, Modality::Text)
        .await
        .unwrap()
}

fn queue() -> (mpsc::Sender<AnalysisJob>, mpsc::Receiver<AnalysisJob>) {
    mpsc::channel(8)
}

//=========================================================================================
// Reconciliation gate
//=========================================================================================

#[tokio::test]
async fn oversized_payloads_are_rejected_before_storage() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    let too_many = turns(201);
    let result = replace_transcript(&db, session.id, 1, &too_many).await;
    assert!(matches!(result, Err(ApiError::InvalidPayload(_))));

    let too_long = vec![turn(0, &"x".repeat(5_001))];
    let result = replace_transcript(&db, session.id, 1, &too_long).await;
    assert!(matches!(result, Err(ApiError::InvalidPayload(_))));

    // Nothing touched storage.
    assert_eq!(db.count_turns(session.id, 1).await.unwrap(), 0);
}

#[tokio::test]
async fn shorter_flush_never_overwrites_a_longer_one() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    let outcome = replace_transcript(&db, session.id, 1, &turns(5)).await.unwrap();
    assert_eq!(outcome, ReplaceOutcome::Written(5));

    let outcome = replace_transcript(&db, session.id, 1, &turns(3)).await.unwrap();
    assert_eq!(outcome, ReplaceOutcome::IgnoredShorter { stored: 5 });

    let stored = db.get_turns(session.id, 1).await.unwrap();
    assert_eq!(stored.len(), 5);
    assert_eq!(stored[4].content, "turn 4");
}

#[tokio::test]
async fn equal_length_replace_is_a_full_replace_not_a_merge() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    replace_transcript(&db, session.id, 1, &[turn(0, "old hi"), turn(1, "old hello")])
        .await
        .unwrap();
    replace_transcript(&db, session.id, 1, &[turn(0, "new hi"), turn(1, "new hello")])
        .await
        .unwrap();

    let stored = db.get_turns(session.id, 1).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].content, "new hi");
    assert_eq!(stored[1].content, "new hello");
}

#[tokio::test]
async fn round_trip_preserves_slots_exactly() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    let payload = vec![
        NewTurn {
            role: TurnRole::User,
            content: "hi".to_string(),
            turn_order: 0,
        },
        NewTurn {
            role: TurnRole::Assistant,
            content: "hello".to_string(),
            turn_order: 1,
        },
    ];
    replace_transcript(&db, session.id, 1, &payload).await.unwrap();

    let stored = db.get_turns(session.id, 1).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].turn_order, 0);
    assert_eq!(stored[0].role, TurnRole::User);
    assert_eq!(stored[0].content, "hi");
    assert_eq!(stored[1].turn_order, 1);
    assert_eq!(stored[1].role, TurnRole::Assistant);
    assert_eq!(stored[1].content, "hello");
}

#[tokio::test]
async fn dual_writers_converge_on_the_longer_view() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    // Client flushes its partial view first, the agent's fuller view lands later.
    replace_transcript(&db, session.id, 1, &turns(3)).await.unwrap();
    let outcome = replace_transcript(&db, session.id, 1, &turns(5)).await.unwrap();
    assert_eq!(outcome, ReplaceOutcome::Written(5));

    // Final count is 5: not 8 (no merge), not 3 (no loss).
    assert_eq!(db.count_turns(session.id, 1).await.unwrap(), 5);
}

#[tokio::test]
async fn writes_to_different_attempts_do_not_interfere() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();
    db.increment_attempt(session.id).await.unwrap();
    replace_transcript(&db, session.id, 2, &turns(2)).await.unwrap();

    assert_eq!(db.count_turns(session.id, 1).await.unwrap(), 4);
    assert_eq!(db.count_turns(session.id, 2).await.unwrap(), 2);
}

//=========================================================================================
// Evaluation orchestrator
//=========================================================================================

#[tokio::test]
async fn evaluation_is_transient_until_ready_then_stable() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let scorer_impl = Arc::new(MockScorer::new().with_findings(vec![AnalysisFinding {
        flag_type: FlagType::OffTopic,
        severity: FlagSeverity::Info,
        details: Some("brief tangent".to_string()),
    }]));
    let scorer: Arc<dyn ScoringService> = scorer_impl.clone();
    let (tx, mut rx) = queue();
    let session = seed_session(&db).await;

    // Only one turn flushed so far: too early, retry later.
    replace_transcript(&db, session.id, 1, &turns(1)).await.unwrap();
    let err = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TranscriptNotReady));
    assert!(err.is_transient());

    // The other writer flushes a fuller view; now evaluation succeeds.
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();
    let evaluation = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(evaluation.overall_score, 78.0);

    // The session is now completed and the scanner was enqueued exactly once.
    let session = db.get_session_by_id(session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(rx.recv().await.unwrap().session_id, session.id);

    // Evaluator findings landed with source=evaluation.
    let flags = db.list_flags(None, None).await.unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].flag.source, FlagSource::Evaluation);
    assert_eq!(flags[0].flag.flag_type, FlagType::OffTopic);

    // A third identical request returns the same record without re-scoring.
    let again = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(again.id, evaluation.id);
    assert_eq!(scorer_impl.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_evaluation_requests_converge_on_one_row() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    // The delay lets every caller pass the idempotency check before any
    // insert happens, forcing the unique-constraint race.
    let scorer: Arc<dyn ScoringService> =
        Arc::new(MockScorer::new().with_delay(Duration::from_millis(10)));
    let (tx, _rx) = queue();
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    let (a, b, c, d) = tokio::join!(
        request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id),
        request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id),
        request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id),
        request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id),
    );

    let ids = [
        a.unwrap().id,
        b.unwrap().id,
        c.unwrap().id,
        d.unwrap().id,
    ];
    assert!(ids.iter().all(|id| *id == ids[0]));

    // Exactly one row exists.
    let stored = db.get_evaluation_by_session(session.id).await.unwrap().unwrap();
    assert_eq!(stored.id, ids[0]);
}

#[tokio::test]
async fn completed_session_without_transcript_is_a_permanent_conflict() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let scorer: Arc<dyn ScoringService> = Arc::new(MockScorer::new());
    let (tx, _rx) = queue();
    let session = seed_session(&db).await;

    replace_transcript(&db, session.id, 1, &turns(1)).await.unwrap();
    db.complete_session(session.id).await.unwrap();

    let err = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::EvaluationConflict(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn scoring_refusal_has_its_own_permanent_signal() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let scorer: Arc<dyn ScoringService> = Arc::new(
        MockScorer::new().failing(|| PortError::Refused("cannot score this".to_string())),
    );
    let (tx, _rx) = queue();
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    let err = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::ScoringRefused));
    assert!(!err.is_transient());

    // Nothing was persisted and the session stays active for a retry with
    // different content.
    assert!(db.get_evaluation_by_session(session.id).await.unwrap().is_none());
    let session = db.get_session_by_id(session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn evaluation_succeeds_even_when_the_analysis_queue_is_gone() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let scorer: Arc<dyn ScoringService> = Arc::new(MockScorer::new());
    let (tx, rx) = queue();
    drop(rx); // worker is dead; enqueueing is best-effort
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    let evaluation = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id).await;
    assert!(evaluation.is_ok());
}

//=========================================================================================
// Post-session analysis scanner
//=========================================================================================

#[tokio::test]
async fn analysis_runs_exactly_once_per_session() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let analyzer_impl = Arc::new(MockAnalyzer::new(vec![
        AnalysisFinding {
            flag_type: FlagType::PromptLeakage,
            severity: FlagSeverity::Warning,
            details: Some("the caller recited its brief".to_string()),
        },
        AnalysisFinding {
            flag_type: FlagType::CharacterBreak,
            severity: FlagSeverity::Info,
            details: Some("persona slipped near the end".to_string()),
        },
    ]));
    let analyzer: Arc<dyn AnalysisService> = analyzer_impl.clone();
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    let outcome = analyze_session(&db, &analyzer, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(outcome, AnalysisOutcome::Flagged { flags_created: 2 });

    let flags = db.list_flags(None, None).await.unwrap();
    assert_eq!(flags.len(), 2);
    assert!(flags.iter().all(|f| f.flag.source == FlagSource::Analysis));

    // Second invocation skips and creates nothing.
    let outcome = analyze_session(&db, &analyzer, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        AnalysisOutcome::Skipped(SkipReason::AlreadyAnalyzed)
    );
    assert_eq!(db.list_flags(None, None).await.unwrap().len(), 2);
    assert_eq!(analyzer_impl.call_count(), 1);
}

#[tokio::test]
async fn analysis_skips_transcripts_that_are_too_short() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let analyzer: Arc<dyn AnalysisService> = Arc::new(MockAnalyzer::new(Vec::new()));
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(1)).await.unwrap();

    let outcome = analyze_session(&db, &analyzer, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(outcome, AnalysisOutcome::Skipped(SkipReason::TooShort));
    assert!(db.list_flags(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn clean_scan_still_leaves_a_clean_audit_flag() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let analyzer: Arc<dyn AnalysisService> = Arc::new(MockAnalyzer::new(Vec::new()));
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    let outcome = analyze_session(&db, &analyzer, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(outcome, AnalysisOutcome::Flagged { flags_created: 0 });

    // "No record" and "scan never ran" stay distinguishable.
    let flags = db.list_flags(None, None).await.unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].flag.flag_type, FlagType::CleanAudit);
    assert!(db
        .has_flag_from_source(session.id, FlagSource::Analysis)
        .await
        .unwrap());
}

#[tokio::test]
async fn analysis_failure_cannot_break_the_evaluation_that_triggered_it() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let scorer: Arc<dyn ScoringService> = Arc::new(MockScorer::new());
    let analyzer: Arc<dyn AnalysisService> = Arc::new(MockAnalyzer::failing());
    let (tx, mut rx) = queue();
    let session = seed_session(&db).await;
    replace_transcript(&db, session.id, 1, &turns(4)).await.unwrap();

    // The evaluation request succeeds regardless of what the scanner will do.
    let evaluation = request_evaluation(&db, &scorer, &tx, INFERENCE_TIMEOUT, session.id)
        .await
        .unwrap();
    assert_eq!(evaluation.session_id, session.id);

    // The queued job fails inside its own boundary; nothing propagates.
    let job = rx.recv().await.unwrap();
    let result = analyze_session(&db, &analyzer, INFERENCE_TIMEOUT, job.session_id).await;
    assert!(matches!(result, Err(PortError::Malformed(_))));
    assert!(db.get_evaluation_by_session(session.id).await.unwrap().is_some());
}

//=========================================================================================
// Bounded evaluation polling
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn polling_retries_transient_failures_then_succeeds() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let policy = RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_secs(2),
    };
    let cancel = CancellationToken::new();

    let counter = attempts.clone();
    let outcome = poll_evaluation(policy, &cancel, move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(ApiError::TranscriptNotReady)
            } else {
                Ok(sample_evaluation())
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(outcome, PollOutcome::Completed(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn polling_gives_up_after_the_attempt_budget() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let policy = RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_secs(2),
    };
    let cancel = CancellationToken::new();

    let counter = attempts.clone();
    let outcome = poll_evaluation(policy, &cancel, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Evaluation, _>(ApiError::TranscriptNotReady) }
    })
    .await
    .unwrap();

    assert!(matches!(outcome, PollOutcome::GaveUp { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn polling_stops_immediately_on_a_permanent_failure() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();

    let counter = attempts.clone();
    let result = poll_evaluation(RetryPolicy::default(), &cancel, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<Evaluation, _>(ApiError::EvaluationConflict("scored elsewhere".into())) }
    })
    .await;

    assert!(matches!(result, Err(ApiError::EvaluationConflict(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn polling_respects_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = poll_evaluation(RetryPolicy::default(), &cancel, || async {
        Ok(sample_evaluation())
    })
    .await
    .unwrap();

    assert!(matches!(outcome, PollOutcome::Cancelled));
}

//=========================================================================================
// Supervisor flag listing
//=========================================================================================

#[tokio::test]
async fn flags_list_critical_first_then_newest() {
    let db: Arc<dyn DatabaseService> = Arc::new(MemoryDb::new());
    let session = seed_session(&db).await;

    for (flag_type, severity) in [
        (FlagType::OffTopic, FlagSeverity::Info),
        (FlagType::Jailbreak, FlagSeverity::Critical),
        (FlagType::PiiSharing, FlagSeverity::Warning),
    ] {
        db.insert_flag(NewFlag {
            session_id: session.id,
            flag_type,
            severity,
            source: FlagSource::Analysis,
            details: None,
        })
        .await
        .unwrap();
    }

    let flags = db.list_flags(None, None).await.unwrap();
    let severities: Vec<FlagSeverity> = flags.iter().map(|f| f.flag.severity).collect();
    assert_eq!(
        severities,
        vec![
            FlagSeverity::Critical,
            FlagSeverity::Warning,
            FlagSeverity::Info
        ]
    );

    let critical_only = db
        .list_flags(None, Some(FlagSeverity::Critical))
        .await
        .unwrap();
    assert_eq!(critical_only.len(), 1);
    assert_eq!(critical_only[0].flag.flag_type, FlagType::Jailbreak);
}

fn sample_evaluation() -> Evaluation {
    Evaluation {
        id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        overall_score: 80.0,
        strengths: Vec::new(),
        areas_to_improve: Vec::new(),
        narrative: String::new(),
        created_at: Utc::now(),
    }
}
