//! Equipment lock handlers.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;

use labgate_core::EquipmentId;

use crate::concurrency::{extract_session_id, AcquireOutcome, LockStatus, ReleaseOutcome};
use crate::error::ApiError;
use crate::schema::locks::{
    AcquireLockRequest, AcquireLockResponse, CancelLockResponse, EventsResponse,
    ForceReleaseRequest, ForceReleaseResponse, ListLocksResponse, QueueResponse,
    ReleaseLockResponse, RenewLockResponse,
};
use crate::state::AppState;

/// `POST /equipment/{id}/lock`
pub async fn acquire_lock(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<AcquireLockRequest>,
) -> Result<Json<AcquireLockResponse>, ApiError> {
    let session_id = extract_session_id(&headers)?;
    let equipment_id = EquipmentId::from(equipment_id);

    if req.lease_timeout_sec == Some(0) {
        return Err(ApiError::BadRequest(
            "lease_timeout_sec must be greater than zero".to_string(),
        ));
    }
    let lease_timeout = req.lease_timeout_sec.map(Duration::from_secs);

    match state
        .service
        .acquire(&equipment_id, &session_id, req.mode, lease_timeout)?
    {
        AcquireOutcome::Denied { reason } => Err(ApiError::lock_denied(&equipment_id, &reason)),
        outcome => Ok(Json(AcquireLockResponse {
            equipment_id,
            session_id,
            outcome,
        })),
    }
}

/// `DELETE /equipment/{id}/lock`
///
/// Releasing a lock the caller does not hold is not an error; the response
/// reports `released: false`.
pub async fn release_lock(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReleaseLockResponse>, ApiError> {
    let session_id = extract_session_id(&headers)?;
    let equipment_id = EquipmentId::from(equipment_id);

    let (released, promoted) = match state.service.release(&equipment_id, &session_id) {
        ReleaseOutcome::Released { promoted } => (true, promoted),
        ReleaseOutcome::NotHeld => (false, None),
    };
    Ok(Json(ReleaseLockResponse {
        equipment_id,
        released,
        promoted,
    }))
}

/// `POST /equipment/{id}/lock/renew`
pub async fn renew_lock(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RenewLockResponse>, ApiError> {
    let session_id = extract_session_id(&headers)?;
    let equipment_id = EquipmentId::from(equipment_id);
    let renewed = state.service.renew(&equipment_id, &session_id);
    Ok(Json(RenewLockResponse {
        equipment_id,
        renewed,
    }))
}

/// `POST /equipment/{id}/lock/cancel`
pub async fn cancel_lock(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CancelLockResponse>, ApiError> {
    let session_id = extract_session_id(&headers)?;
    let equipment_id = EquipmentId::from(equipment_id);
    let cancelled = state.service.cancel(&equipment_id, &session_id);
    Ok(Json(CancelLockResponse {
        equipment_id,
        cancelled,
    }))
}

/// `POST /equipment/{id}/lock/force-release`
pub async fn force_release(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
    Json(req): Json<ForceReleaseRequest>,
) -> Result<Json<ForceReleaseResponse>, ApiError> {
    let equipment_id = EquipmentId::from(equipment_id);
    let actor = req.actor.as_deref().unwrap_or("admin");

    let evicted = match req.observer {
        Some(observer) => {
            if !state
                .service
                .force_release_observer(&equipment_id, &observer, actor)
            {
                return Err(ApiError::NotFound(format!(
                    "{observer} does not observe {equipment_id}"
                )));
            }
            vec![observer]
        }
        None => state.service.force_release(&equipment_id, actor),
    };
    Ok(Json(ForceReleaseResponse {
        equipment_id,
        evicted,
    }))
}

/// `GET /equipment/{id}/lock`
pub async fn lock_status(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
) -> Json<LockStatus> {
    Json(state.service.status(&EquipmentId::from(equipment_id)))
}

/// `GET /locks`
pub async fn list_locks(State(state): State<AppState>) -> Json<ListLocksResponse> {
    Json(ListLocksResponse {
        locks: state.service.status_all(),
    })
}

/// `GET /equipment/{id}/queue`
pub async fn list_queue(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
) -> Json<QueueResponse> {
    let equipment_id = EquipmentId::from(equipment_id);
    let queue = state.service.list_queue(&equipment_id);
    Json(QueueResponse {
        equipment_id,
        queue,
    })
}

/// `GET /equipment/{id}/events`
pub async fn list_events(
    State(state): State<AppState>,
    Path(equipment_id): Path<String>,
) -> Json<EventsResponse> {
    let equipment_id = EquipmentId::from(equipment_id);
    let events = state.service.list_events(&equipment_id);
    Json(EventsResponse {
        equipment_id,
        events,
    })
}
