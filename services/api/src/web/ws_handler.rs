//! services/api/src/web/ws_handler.rs
//!
//! The live transport channel endpoint and the agent-side writer.
//!
//! For the lifetime of a connection the handler accumulates every turn event
//! it observes into its own buffer. On teardown (an explicit `Finish` or a
//! disconnect) it flushes the full accumulated list through the same
//! idempotent write contract the client-side writer uses, so either writer
//! flushing first is safe. The two writers are deliberately uncoordinated:
//! the channel can silently drop messages to either side, and whichever view
//! is more complete wins at the store.

use crate::web::{
    evaluation::{poll_evaluation, request_evaluation, PollOutcome, RetryPolicy},
    protocol::{ClientMessage, ServerMessage},
    state::AppState,
    transcript::replace_transcript,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use counselor_core::domain::SessionStatus;
use counselor_core::transcript::{NewTurn, ReplaceOutcome, TurnBuffer};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state))
}

/// How a connection's main loop ended.
enum Teardown {
    /// The user explicitly finished; flush and drive evaluation.
    Finished,
    /// The peer went away; the flush is the safety net, evaluation is the
    /// client-side writer's job if it is still alive.
    Disconnected,
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>) {
    info!("New live-channel connection established");

    let (sender, mut receiver) = socket.split();
    let ws_sender = Arc::new(Mutex::new(sender));

    // --- 1. Initialization Phase ---
    let (session_id, attempt_number) = match receiver.next().await {
        Some(Ok(Message::Text(init_json))) => {
            match serde_json::from_str::<ClientMessage>(&init_json) {
                Ok(ClientMessage::Init { session_id }) => {
                    match app_state.db.get_session_by_id(session_id).await {
                        Ok(session) if session.status == SessionStatus::Active => {
                            let init_msg = ServerMessage::SessionInitialized {
                                session_id,
                                attempt_number: session.current_attempt,
                            };
                            if send_message(&ws_sender, &init_msg).await.is_err() {
                                error!("Failed to send session initialized message.");
                                return;
                            }
                            (session_id, session.current_attempt)
                        }
                        Ok(_) => {
                            let _ = send_message(
                                &ws_sender,
                                &ServerMessage::Error {
                                    message: "Session is already completed.".to_string(),
                                },
                            )
                            .await;
                            return;
                        }
                        Err(e) => {
                            error!("Failed to get session: {:?}", e);
                            let _ = send_message(
                                &ws_sender,
                                &ServerMessage::Error {
                                    message: "Failed to load session data.".to_string(),
                                },
                            )
                            .await;
                            return;
                        }
                    }
                }
                _ => {
                    error!("First message was not a valid Init message.");
                    return;
                }
            }
        }
        _ => {
            error!("Client disconnected before sending Init message.");
            return;
        }
    };

    // --- 2. Main Message Loop: accumulate turn events ---
    let mut buffer = TurnBuffer::new();
    let teardown = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Turn {
                        role,
                        content,
                        turn_order,
                    }) => {
                        buffer.push(NewTurn {
                            role,
                            content,
                            turn_order,
                        });
                    }
                    Ok(ClientMessage::Finish) => {
                        info!(%session_id, "Finish message received.");
                        break Teardown::Finished;
                    }
                    Ok(ClientMessage::Init { .. }) => {
                        warn!("Received subsequent Init message, which is ignored.");
                    }
                    Err(e) => {
                        warn!("Failed to deserialize client message: {}", e);
                    }
                }
            }
            Some(Ok(Message::Close(_))) => {
                info!(%session_id, "Client sent close message.");
                break Teardown::Disconnected;
            }
            Some(Ok(_)) => {}
            _ => {
                info!(%session_id, "Client disconnected.");
                break Teardown::Disconnected;
            }
        }
    };

    // --- 3. Teardown: the agent-side flush ---
    let written = flush_buffer(&app_state, session_id, attempt_number, buffer).await;

    if let Teardown::Finished = teardown {
        if let Some(written) = written {
            let _ = send_message(&ws_sender, &ServerMessage::TranscriptFlushed { written }).await;
        }
        drive_evaluation(&app_state, session_id, &ws_sender).await;
    }

    info!(%session_id, "Live-channel connection closed.");
}

/// Flushes the accumulated buffer with a bounded timeout. A failed or
/// timed-out flush is logged and swallowed: the client-side writer holds an
/// independent copy, and either writer succeeding is enough.
async fn flush_buffer(
    app_state: &Arc<AppState>,
    session_id: Uuid,
    attempt_number: i32,
    buffer: TurnBuffer,
) -> Option<usize> {
    if buffer.is_empty() {
        info!(%session_id, "agent-side buffer is empty, nothing to flush");
        return Some(0);
    }
    let turns = buffer.into_turns();
    let flush = replace_transcript(&app_state.db, session_id, attempt_number, &turns);
    match tokio::time::timeout(app_state.config.flush_timeout, flush).await {
        Ok(Ok(ReplaceOutcome::Written(written))) => Some(written),
        Ok(Ok(ReplaceOutcome::IgnoredShorter { stored })) => {
            info!(%session_id, stored, "agent flush was shorter than stored, ignored");
            Some(0)
        }
        Ok(Err(e)) => {
            error!(%session_id, "agent-side flush failed: {e}");
            None
        }
        Err(_) => {
            error!(%session_id, "agent-side flush timed out");
            None
        }
    }
}

/// Drives the bounded evaluation polling loop on the session's behalf after
/// an explicit finish, reporting the outcome over the channel.
async fn drive_evaluation(
    app_state: &Arc<AppState>,
    session_id: Uuid,
    ws_sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
) {
    let cancel = CancellationToken::new();
    let result = poll_evaluation(RetryPolicy::default(), &cancel, || {
        request_evaluation(
            &app_state.db,
            &app_state.scoring_adapter,
            &app_state.analysis_queue,
            app_state.config.inference_timeout,
            session_id,
        )
    })
    .await;

    let reply = match result {
        Ok(PollOutcome::Completed(evaluation)) => ServerMessage::EvaluationCompleted {
            session_id,
            overall_score: evaluation.overall_score,
        },
        Ok(PollOutcome::GaveUp { last_error }) => {
            warn!(%session_id, "evaluation polling exhausted its budget: {last_error}");
            ServerMessage::EvaluationFailed {
                message: "Evaluation is taking longer than expected. Please try again."
                    .to_string(),
            }
        }
        Ok(PollOutcome::Cancelled) => return,
        Err(e) => {
            error!(%session_id, "evaluation failed permanently: {e}");
            ServerMessage::EvaluationFailed {
                message: e.to_string(),
            }
        }
    };
    let _ = send_message(ws_sender, &reply).await;
}

async fn send_message(
    ws_sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    ws_sender
        .lock()
        .await
        .send(Message::Text(json.into()))
        .await
}
