//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crate::web::analysis_task::AnalysisQueue;
use counselor_core::ports::{AnalysisService, DatabaseService, ScoringService};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub config: Arc<Config>,
    pub scoring_adapter: Arc<dyn ScoringService>,
    pub analysis_adapter: Arc<dyn AnalysisService>,
    /// Hand-off point for the post-session analysis worker. Enqueueing is
    /// best-effort; the worker owns its own error boundary.
    pub analysis_queue: AnalysisQueue,
}
