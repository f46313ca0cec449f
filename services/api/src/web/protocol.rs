//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol for the live transcript channel.
//! Both writer roles observe the same structured turn events; the server side
//! of this protocol is the agent-side writer.

use counselor_core::domain::TurnRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// Represents the structured text messages a client can send to the server.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Initializes a connection against a session. This must be the first
    /// message sent on the connection.
    Init { session_id: Uuid },

    /// One turn event observed on the live channel. Delivery is reliable-ish,
    /// not exactly-once: the same `turn_order` may arrive more than once.
    Turn {
        role: TurnRole,
        content: String,
        turn_order: i32,
    },

    /// The user ended the session. The server flushes its accumulated buffer
    /// and then drives the evaluation request on the session's behalf.
    Finish,
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Represents the structured text messages the server can send to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms successful session initialization.
    SessionInitialized {
        session_id: Uuid,
        attempt_number: i32,
    },

    /// Reports a fatal error to the client, which should display an error message.
    Error { message: String },

    /// The agent-side flush finished. `written` is zero when the store kept a
    /// longer transcript from the other writer, which is a normal outcome.
    TranscriptFlushed { written: usize },

    /// Evaluation finished after a `Finish` message.
    EvaluationCompleted {
        session_id: Uuid,
        overall_score: f64,
    },

    /// Evaluation did not complete within the bounded retry budget. The
    /// client can retry through the REST endpoint.
    EvaluationFailed { message: String },
}
