//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! The transcript replace protocol and the session state machine both live at
//! this boundary: the replace runs as a single transaction, and every status or
//! attempt mutation is a conditional `UPDATE`, never read-then-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use counselor_core::domain::{
    Evaluation, FlagSeverity, FlagSource, FlagStatus, FlagType, FlagWithSession, Modality,
    Session, SessionFlag, SessionStatus, TranscriptTurn, TurnRole,
};
use counselor_core::ports::{
    DatabaseService, NewEvaluation, NewFlag, PortError, PortResult,
};
use counselor_core::transcript::{NewTurn, ReplaceOutcome};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct SessionRecord {
    id: Uuid,
    user_id: Uuid,
    scenario_id: Option<Uuid>,
    modality: String,
    status: String,
    current_attempt: i32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}
impl SessionRecord {
    fn to_domain(self) -> PortResult<Session> {
        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            scenario_id: self.scenario_id,
            modality: parse_enum::<Modality>(&self.modality)?,
            status: parse_enum::<SessionStatus>(&self.status)?,
            current_attempt: self.current_attempt,
            started_at: self.started_at,
            ended_at: self.ended_at,
        })
    }
}

#[derive(FromRow)]
struct TurnRecord {
    session_id: Uuid,
    attempt_number: i32,
    turn_order: i32,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}
impl TurnRecord {
    fn to_domain(self) -> PortResult<TranscriptTurn> {
        Ok(TranscriptTurn {
            session_id: self.session_id,
            attempt_number: self.attempt_number,
            turn_order: self.turn_order,
            role: parse_enum::<TurnRole>(&self.role)?,
            content: self.content,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct EvaluationRecord {
    id: Uuid,
    session_id: Uuid,
    overall_score: f64,
    strengths: Vec<String>,
    areas_to_improve: Vec<String>,
    narrative: String,
    created_at: DateTime<Utc>,
}
impl EvaluationRecord {
    fn to_domain(self) -> Evaluation {
        Evaluation {
            id: self.id,
            session_id: self.session_id,
            overall_score: self.overall_score,
            strengths: self.strengths,
            areas_to_improve: self.areas_to_improve,
            narrative: self.narrative,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct FlagRecord {
    id: Uuid,
    session_id: Uuid,
    flag_type: String,
    severity: String,
    source: String,
    status: String,
    details: Option<String>,
    created_at: DateTime<Utc>,
}
impl FlagRecord {
    fn to_domain(self) -> PortResult<SessionFlag> {
        Ok(SessionFlag {
            id: self.id,
            session_id: self.session_id,
            flag_type: parse_enum::<FlagType>(&self.flag_type)?,
            severity: parse_enum::<FlagSeverity>(&self.severity)?,
            source: parse_enum::<FlagSource>(&self.source)?,
            status: parse_enum::<FlagStatus>(&self.status)?,
            details: self.details,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct FlagWithSessionRecord {
    id: Uuid,
    session_id: Uuid,
    flag_type: String,
    severity: String,
    source: String,
    status: String,
    details: Option<String>,
    created_at: DateTime<Utc>,
    session_user_id: Uuid,
    session_modality: String,
    session_started_at: DateTime<Utc>,
}
impl FlagWithSessionRecord {
    fn to_domain(self) -> PortResult<FlagWithSession> {
        let flag = FlagRecord {
            id: self.id,
            session_id: self.session_id,
            flag_type: self.flag_type,
            severity: self.severity,
            source: self.source,
            status: self.status,
            details: self.details,
            created_at: self.created_at,
        }
        .to_domain()?;
        Ok(FlagWithSession {
            flag,
            session_user_id: self.session_user_id,
            session_modality: parse_enum::<Modality>(&self.session_modality)?,
            session_started_at: self.session_started_at,
        })
    }
}

/// Stored enum values are validated once here; anything unknown means the
/// database was written around the closed domain enums.
fn parse_enum<T: std::str::FromStr<Err = counselor_core::domain::InvalidEnumValue>>(
    raw: &str,
) -> PortResult<T> {
    raw.parse::<T>()
        .map_err(|e| PortError::Malformed(e.to_string()))
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_or_create_user(&self, user_id: Uuid) -> PortResult<Uuid> {
        sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(user_id)
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        scenario_id: Option<Uuid>,
        modality: Modality,
    ) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "INSERT INTO sessions (id, user_id, scenario_id, modality) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, user_id, scenario_id, modality, status, current_attempt, started_at, ended_at",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(scenario_id)
        .bind(modality.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn get_session_by_id(&self, session_id: Uuid) -> PortResult<Session> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT id, user_id, scenario_id, modality, status, current_attempt, started_at, ended_at \
             FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                PortError::NotFound(format!("Session {} not found", session_id))
            }
            _ => unexpected(e),
        })?;
        record.to_domain()
    }

    async fn increment_attempt(&self, session_id: Uuid) -> PortResult<i32> {
        // Conditional update: only an active session can gain a new attempt.
        let new_attempt: Option<i32> = sqlx::query_scalar(
            "UPDATE sessions SET current_attempt = current_attempt + 1 \
             WHERE id = $1 AND status = 'active' \
             RETURNING current_attempt",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;

        match new_attempt {
            Some(n) => Ok(n),
            None => {
                // Distinguish a missing session from a completed one.
                self.get_session_by_id(session_id).await?;
                Err(PortError::Conflict(format!(
                    "Session {} is not active",
                    session_id
                )))
            }
        }
    }

    async fn complete_session(&self, session_id: Uuid) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'completed', ended_at = now() \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        if result.rows_affected() == 0 {
            // Already completed is a no-op; only a missing session is an error.
            self.get_session_by_id(session_id).await?;
        }
        Ok(())
    }

    async fn replace_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
        turns: &[NewTurn],
    ) -> PortResult<ReplaceOutcome> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transcript_turns \
             WHERE session_id = $1 AND attempt_number = $2",
        )
        .bind(session_id)
        .bind(attempt_number)
        .fetch_one(&mut *tx)
        .await
        .map_err(unexpected)?;

        // The anti-data-loss guard: a shorter flush never overwrites a longer
        // one written by the other writer. Acknowledged, not an error.
        if (turns.len() as i64) < stored {
            tx.rollback().await.map_err(unexpected)?;
            return Ok(ReplaceOutcome::IgnoredShorter {
                stored: stored as usize,
            });
        }

        sqlx::query(
            "DELETE FROM transcript_turns WHERE session_id = $1 AND attempt_number = $2",
        )
        .bind(session_id)
        .bind(attempt_number)
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        for turn in turns {
            sqlx::query(
                "INSERT INTO transcript_turns (session_id, attempt_number, turn_order, role, content) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(session_id)
            .bind(attempt_number)
            .bind(turn.turn_order)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        }

        tx.commit().await.map_err(unexpected)?;
        Ok(ReplaceOutcome::Written(turns.len()))
    }

    async fn get_turns(
        &self,
        session_id: Uuid,
        attempt_number: i32,
    ) -> PortResult<Vec<TranscriptTurn>> {
        let records = sqlx::query_as::<_, TurnRecord>(
            "SELECT session_id, attempt_number, turn_order, role, content, created_at \
             FROM transcript_turns \
             WHERE session_id = $1 AND attempt_number = $2 \
             ORDER BY turn_order ASC",
        )
        .bind(session_id)
        .bind(attempt_number)
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn count_turns(&self, session_id: Uuid, attempt_number: i32) -> PortResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transcript_turns \
             WHERE session_id = $1 AND attempt_number = $2",
        )
        .bind(session_id)
        .bind(attempt_number)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(count as usize)
    }

    async fn get_evaluation_by_session(
        &self,
        session_id: Uuid,
    ) -> PortResult<Option<Evaluation>> {
        let record = sqlx::query_as::<_, EvaluationRecord>(
            "SELECT id, session_id, overall_score, strengths, areas_to_improve, narrative, created_at \
             FROM evaluations WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn insert_evaluation(&self, evaluation: NewEvaluation) -> PortResult<Evaluation> {
        let record = sqlx::query_as::<_, EvaluationRecord>(
            "INSERT INTO evaluations (id, session_id, overall_score, strengths, areas_to_improve, narrative) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, session_id, overall_score, strengths, areas_to_improve, narrative, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(evaluation.session_id)
        .bind(evaluation.overall_score)
        .bind(&evaluation.strengths)
        .bind(&evaluation.areas_to_improve)
        .bind(&evaluation.narrative)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                PortError::Conflict(format!(
                    "Evaluation already exists for session {}",
                    evaluation.session_id
                ))
            } else {
                unexpected(e)
            }
        })?;
        Ok(record.to_domain())
    }

    async fn insert_flag(&self, flag: NewFlag) -> PortResult<SessionFlag> {
        let record = sqlx::query_as::<_, FlagRecord>(
            "INSERT INTO session_flags (id, session_id, flag_type, severity, source, details) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, session_id, flag_type, severity, source, status, details, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(flag.session_id)
        .bind(flag.flag_type.as_str())
        .bind(flag.severity.as_str())
        .bind(flag.source.as_str())
        .bind(&flag.details)
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        record.to_domain()
    }

    async fn has_flag_from_source(
        &self,
        session_id: Uuid,
        source: FlagSource,
    ) -> PortResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM session_flags WHERE session_id = $1 AND source = $2)",
        )
        .bind(session_id)
        .bind(source.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(exists)
    }

    async fn list_flags(
        &self,
        status: Option<FlagStatus>,
        severity: Option<FlagSeverity>,
    ) -> PortResult<Vec<FlagWithSession>> {
        let records = sqlx::query_as::<_, FlagWithSessionRecord>(
            "SELECT f.id, f.session_id, f.flag_type, f.severity, f.source, f.status, \
                    f.details, f.created_at, \
                    s.user_id AS session_user_id, s.modality AS session_modality, \
                    s.started_at AS session_started_at \
             FROM session_flags f \
             JOIN sessions s ON s.id = f.session_id \
             WHERE ($1::text IS NULL OR f.status = $1) \
               AND ($2::text IS NULL OR f.severity = $2) \
             ORDER BY CASE f.severity \
                        WHEN 'critical' THEN 0 \
                        WHEN 'warning' THEN 1 \
                        ELSE 2 \
                      END, \
                      f.created_at DESC",
        )
        .bind(status.map(|s| s.as_str().to_string()))
        .bind(severity.map(|s| s.as_str().to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn get_scenario_prompt(&self, scenario_id: Uuid) -> PortResult<Option<String>> {
        let prompt: Option<Option<String>> =
            sqlx::query_scalar("SELECT prompt FROM scenarios WHERE id = $1")
                .bind(scenario_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unexpected)?;
        // A missing scenario degrades to generic criteria, same as a NULL prompt.
        Ok(prompt.flatten())
    }
}
