//! services/api/src/web/middleware.rs
//!
//! Authorization middleware for the supervisor-only flag review surface.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::state::AppState;

/// Middleware that checks the shared supervisor token.
///
/// Supervisors present `Authorization: Bearer <token>`. When no token is
/// configured the surface is disabled entirely rather than left open.
pub async fn require_supervisor(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.supervisor_token.as_deref() else {
        warn!("flag review requested but SUPERVISOR_TOKEN is not configured");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if presented != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}
