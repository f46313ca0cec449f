//! services/api/src/web/analysis_task.rs
//!
//! The post-session analysis scanner: a background worker that runs one
//! combined safety + consistency pass over a finished transcript, exactly
//! once per session. It is triggered server-side from the evaluation
//! orchestrator and is strictly best-effort: its failures are logged at the
//! worker boundary and can never break the evaluation response.

use counselor_core::domain::{FlagSeverity, FlagSource, FlagType};
use counselor_core::ports::{AnalysisService, DatabaseService, NewFlag, PortError, PortResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Below this many turns there is nothing meaningful to audit.
const MIN_TURNS_FOR_ANALYSIS: usize = 3;

/// A unit of work for the analysis worker.
#[derive(Debug)]
pub struct AnalysisJob {
    pub session_id: Uuid,
}

/// Producer half of the analysis queue, stored in `AppState`.
pub type AnalysisQueue = mpsc::Sender<AnalysisJob>;

/// Why a scan did not run. Both are normal outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyAnalyzed,
    TooShort,
}

/// What a single scan did.
#[derive(Debug, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Flagged { flags_created: usize },
    Skipped(SkipReason),
}

/// Spawns the worker that drains analysis jobs for the life of the process.
/// This is the error boundary: a failed scan is logged and the worker moves on.
pub fn spawn_analysis_worker(
    db: Arc<dyn DatabaseService>,
    analyzer: Arc<dyn AnalysisService>,
    inference_timeout: Duration,
) -> AnalysisQueue {
    let (tx, mut rx) = mpsc::channel::<AnalysisJob>(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match analyze_session(&db, &analyzer, inference_timeout, job.session_id).await {
                Ok(AnalysisOutcome::Flagged { flags_created }) => {
                    info!(session_id = %job.session_id, flags_created, "analysis scan finished");
                }
                Ok(AnalysisOutcome::Skipped(reason)) => {
                    info!(session_id = %job.session_id, ?reason, "analysis scan skipped");
                }
                Err(e) => {
                    error!(session_id = %job.session_id, "analysis scan failed: {e}");
                }
            }
        }
        info!("analysis worker shutting down, queue closed");
    });
    tx
}

/// Runs the combined classification pass for one session.
///
/// Idempotent by construction: a `source=analysis` flag already on the session
/// means the scan ran, so the second call skips. A clean scan still writes one
/// `clean-audit` flag, so "no record" and "scan never ran" stay distinguishable.
pub async fn analyze_session(
    db: &Arc<dyn DatabaseService>,
    analyzer: &Arc<dyn AnalysisService>,
    inference_timeout: Duration,
    session_id: Uuid,
) -> PortResult<AnalysisOutcome> {
    if db
        .has_flag_from_source(session_id, FlagSource::Analysis)
        .await?
    {
        return Ok(AnalysisOutcome::Skipped(SkipReason::AlreadyAnalyzed));
    }

    let session = db.get_session_by_id(session_id).await?;
    let turns = db.get_turns(session_id, session.current_attempt).await?;
    if turns.len() < MIN_TURNS_FOR_ANALYSIS {
        return Ok(AnalysisOutcome::Skipped(SkipReason::TooShort));
    }

    let scenario_prompt = match session.scenario_id {
        Some(scenario_id) => match db.get_scenario_prompt(scenario_id).await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(%session_id, "scenario lookup failed, auditing without a brief: {e}");
                None
            }
        },
        None => None,
    };

    let findings = tokio::time::timeout(
        inference_timeout,
        analyzer.classify_transcript(&turns, scenario_prompt.as_deref()),
    )
    .await
    .map_err(|_| {
        PortError::Timeout(format!(
            "analysis did not finish within {}s",
            inference_timeout.as_secs()
        ))
    })??;

    if findings.is_empty() {
        // Proof the scan ran.
        db.insert_flag(NewFlag {
            session_id,
            flag_type: FlagType::CleanAudit,
            severity: FlagSeverity::Info,
            source: FlagSource::Analysis,
            details: None,
        })
        .await?;
        return Ok(AnalysisOutcome::Flagged { flags_created: 0 });
    }

    let mut flags_created = 0;
    for finding in findings {
        db.insert_flag(NewFlag {
            session_id,
            flag_type: finding.flag_type,
            severity: finding.severity,
            source: FlagSource::Analysis,
            details: finding.details,
        })
        .await?;
        flags_created += 1;
    }

    Ok(AnalysisOutcome::Flagged { flags_created })
}
