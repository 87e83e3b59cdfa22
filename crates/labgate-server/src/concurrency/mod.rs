//! Equipment access arbitration.
//!
//! Provides the building blocks for sharing lab instruments between
//! concurrent clients:
//! - [`session::SessionRegistry`] for client session lifecycle
//! - [`lock_manager::LockManager`] for per-equipment lease locks
//! - [`gate::PermissionGate`] for per-command checks
//! - [`cleanup::CleanupScheduler`] and [`disconnect`] for automatic release

pub mod cleanup;
pub mod disconnect;
pub mod events;
pub mod gate;
pub mod lock_manager;
pub mod session;

pub use cleanup::{CleanupScheduler, SweepReport};
pub use disconnect::{handle_disconnect, spawn_disconnect_listener, DisconnectHook};
pub use events::{EventHistory, LockEvent, LockEventKind};
pub use gate::{CommandClass, CommandClassifier, PermissionGate};
pub use lock_manager::{
    AcquireOutcome, DenialReason, EquipmentMode, ExpiredLease, HolderStatus, LockManager,
    LockMode, LockStatus, QueueEntry, ReleaseOutcome,
};
pub use session::{SessionInfo, SessionMetadata, SessionRegistry};

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use labgate_core::SessionId;

use crate::error::ApiError;

/// Name of the header carrying the caller's session id.
pub const SESSION_HEADER: &str = "X-Session-Id";

/// Extracts the session ID from the `X-Session-Id` HTTP header.
///
/// Returns `ApiError::SessionRequired` if the header is missing or empty.
pub fn extract_session_id(headers: &axum::http::HeaderMap) -> Result<SessionId, ApiError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(SessionId::from)
        .ok_or_else(|| ApiError::SessionRequired(format!("{SESSION_HEADER} header required")))
}

/// Maps a monotonic instant onto the wall clock for display.
pub(crate) fn wall_clock(at: Instant, now: Instant, now_utc: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(now.saturating_duration_since(at))
        .map(|elapsed| now_utc - elapsed)
        .unwrap_or(now_utc)
}

pub(crate) fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
