//! Command authorization handler.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use labgate_core::EquipmentId;

use crate::concurrency::extract_session_id;
use crate::error::ApiError;
use crate::schema::commands::{AuthorizeCommandRequest, AuthorizeCommandResponse};
use crate::state::AppState;

/// `POST /equipment/{id}/commands/authorize`
///
/// Runs the permission gate for one command; 423 when denied.
pub async fn authorize_command(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AuthorizeCommandRequest>,
) -> Result<Json<AuthorizeCommandResponse>, ApiError> {
    let session_id = extract_session_id(&headers)?;
    let equipment_id = EquipmentId::from(equipment_id);

    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }

    let class = state
        .service
        .authorize(&equipment_id, &session_id, &req.command)?;
    Ok(Json(AuthorizeCommandResponse {
        equipment_id,
        session_id,
        command: req.command,
        class,
        allowed: true,
    }))
}
