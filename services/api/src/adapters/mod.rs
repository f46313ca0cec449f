pub mod analysis_llm;
pub mod db;
pub mod scoring_llm;

use counselor_core::domain::{TranscriptTurn, TurnRole};

/// Renders a transcript into the plain-text form both inference adapters send.
/// The trainee is the counselor; the assistant role is the simulated caller.
pub(crate) fn render_transcript(turns: &[TranscriptTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "COUNSELOR (trainee)",
                TurnRole::Assistant => "CALLER (simulated)",
            };
            format!("[{}] {}: {}", turn.turn_order, speaker, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
