pub mod analysis_task;
pub mod evaluation;
pub mod middleware;
pub mod protocol;
pub mod rest;
pub mod state;
pub mod transcript;
pub mod ws_handler;

// Re-export the main WebSocket handler to make it easily accessible
// to the binary that will build the web server router.
pub use middleware::require_supervisor;
pub use rest::{
    increment_attempt_handler, list_flags_handler, replace_transcript_handler,
    request_evaluation_handler, start_session_handler, submit_feedback_handler,
};
pub use ws_handler::ws_handler;
