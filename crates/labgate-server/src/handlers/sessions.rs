//! Session lifecycle handlers.

use axum::extract::{Path, State};
use axum::Json;

use labgate_core::SessionId;

use crate::concurrency::SessionInfo;
use crate::error::ApiError;
use crate::schema::sessions::{
    CreateSessionRequest, EndSessionResponse, HeartbeatResponse, ListSessionsResponse,
};
use crate::state::AppState;

/// `POST /sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let info = state.service.create_session(req.session_id, req.metadata)?;
    Ok(Json(info))
}

/// `GET /sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    Json(ListSessionsResponse {
        sessions: state.service.list_sessions(),
    })
}

/// `GET /sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    Ok(Json(state.service.get_session(&SessionId::from(session_id))?))
}

/// `DELETE /sessions/{id}`
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    let session_id = SessionId::from(session_id);
    let released = state.service.end_session(&session_id)?;
    Ok(Json(EndSessionResponse {
        session_id,
        released,
    }))
}

/// `POST /sessions/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    Ok(Json(state.service.heartbeat(&SessionId::from(session_id))?))
}
