//! Session discovery HTTP API.
//!
//! - `POST /sessions` creates a session and answers `201`.
//! - `GET /sessions/{id}` answers `200` if it exists, `404` otherwise.
//!
//! Both return `{"session_id", "exists", "peers"}`. The router shares the
//! relay's [`SessionRegistry`], so a session created here is immediately
//! joinable over the realtime channel.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::protocol::SessionId;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub exists: bool,
    pub peers: usize,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn create_session(
    State(registry): State<Arc<SessionRegistry>>,
) -> (StatusCode, Json<SessionStatus>) {
    let session_id = registry.create_session();
    (
        StatusCode::CREATED,
        Json(SessionStatus {
            session_id,
            exists: true,
            peers: 0,
        }),
    )
}

async fn get_session(
    State(registry): State<Arc<SessionRegistry>>,
    Path(session_id): Path<SessionId>,
) -> (StatusCode, Json<SessionStatus>) {
    match registry.get(&session_id) {
        Some(session) => (
            StatusCode::OK,
            Json(SessionStatus {
                session_id,
                exists: true,
                peers: session.peer_count(),
            }),
        ),
        None => {
            log::debug!("Lookup of unknown session {session_id}");
            (
                StatusCode::NOT_FOUND,
                Json(SessionStatus {
                    session_id,
                    exists: false,
                    peers: 0,
                }),
            )
        }
    }
}
