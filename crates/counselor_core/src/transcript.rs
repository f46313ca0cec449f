//! crates/counselor_core/src/transcript.rs
//!
//! Pure logic for the transcript replace protocol: payload validation, the
//! per-writer accumulation buffer, and the outcome type of the reconciliation
//! gate. Both writers and the store share these definitions so the caps and
//! dedup rules cannot drift apart.

use crate::domain::TurnRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum number of turns a single flush may carry.
pub const MAX_TURNS_PER_FLUSH: usize = 200;

/// Maximum length of a single turn's content, in characters.
pub const MAX_TURN_CONTENT_CHARS: usize = 5_000;

/// The wire shape of one turn as both writers submit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub turn_order: i32,
}

/// Why an incoming turn payload was rejected before touching storage.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TurnValidationError {
    #[error("payload has {count} turns, the maximum per flush is {MAX_TURNS_PER_FLUSH}")]
    TooManyTurns { count: usize },
    #[error("turn {turn_order} has {chars} characters, the maximum is {MAX_TURN_CONTENT_CHARS}")]
    ContentTooLong { turn_order: i32, chars: usize },
    #[error("turn order {turn_order} is negative")]
    NegativeOrder { turn_order: i32 },
    #[error("turn order {turn_order} appears more than once")]
    DuplicateOrder { turn_order: i32 },
}

/// Validates payload bounds before any storage call is made.
///
/// Duplicate orders are a client error here: each writer is expected to have
/// deduplicated its own buffer (see [`TurnBuffer`]) before flushing.
pub fn validate_turns(turns: &[NewTurn]) -> Result<(), TurnValidationError> {
    if turns.len() > MAX_TURNS_PER_FLUSH {
        return Err(TurnValidationError::TooManyTurns { count: turns.len() });
    }
    let mut seen = std::collections::BTreeSet::new();
    for turn in turns {
        if turn.turn_order < 0 {
            return Err(TurnValidationError::NegativeOrder {
                turn_order: turn.turn_order,
            });
        }
        let chars = turn.content.chars().count();
        if chars > MAX_TURN_CONTENT_CHARS {
            return Err(TurnValidationError::ContentTooLong {
                turn_order: turn.turn_order,
                chars,
            });
        }
        if !seen.insert(turn.turn_order) {
            return Err(TurnValidationError::DuplicateOrder {
                turn_order: turn.turn_order,
            });
        }
    }
    Ok(())
}

/// True when the orders do not form a contiguous `0..len` range. Gaps are a
/// signal worth logging, never a hard error: the live channel can drop
/// messages to either writer.
pub fn has_order_gaps(turns: &[NewTurn]) -> bool {
    let max_order = turns.iter().map(|t| t.turn_order).max();
    match max_order {
        Some(max) => (max as usize) + 1 != turns.len(),
        None => false,
    }
}

/// Per-writer accumulator for turn events observed on the live channel.
///
/// The channel is reliable-ish, not exactly-once, so the same `turn_order` can
/// arrive more than once even within one writer; the last event wins. Turns
/// come out sorted ascending by order.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    by_order: BTreeMap<i32, NewTurn>,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a turn event, replacing any earlier event with the same order.
    pub fn push(&mut self, turn: NewTurn) {
        self.by_order.insert(turn.turn_order, turn);
    }

    pub fn len(&self) -> usize {
        self.by_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.is_empty()
    }

    /// Drains the buffer into a flush payload, sorted ascending by order.
    pub fn into_turns(self) -> Vec<NewTurn> {
        self.by_order.into_values().collect()
    }
}

/// Result of the idempotent replace protocol.
///
/// `IgnoredShorter` is a normal outcome, not an error: whichever writer has
/// the more complete view should win, and "more complete" is approximated by
/// turn count. Two equally long but divergent partial views cannot be told
/// apart by this heuristic; that limitation is accepted and documented rather
/// than papered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The incoming set replaced the stored one; carries the count written.
    Written(usize),
    /// The incoming set was strictly shorter than what is already stored and
    /// was dropped to avoid destroying the more complete view.
    IgnoredShorter { stored: usize },
}

impl ReplaceOutcome {
    pub fn written(&self) -> usize {
        match self {
            ReplaceOutcome::Written(n) => *n,
            ReplaceOutcome::IgnoredShorter { .. } => 0,
        }
    }
}
