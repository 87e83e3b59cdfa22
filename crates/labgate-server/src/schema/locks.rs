//! Schema types for equipment lock API.

use serde::{Deserialize, Serialize};

use labgate_core::{EquipmentId, SessionId};

use crate::concurrency::{AcquireOutcome, LockEvent, LockMode, LockStatus, QueueEntry};

/// Request to acquire a lease on one piece of equipment.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquireLockRequest {
    /// "exclusive" or "observe".
    pub mode: LockMode,
    /// Lease timeout override in seconds.
    #[serde(default)]
    pub lease_timeout_sec: Option<u64>,
}

/// Response for a granted or queued request. Denials are 423 errors.
#[derive(Debug, Clone, Serialize)]
pub struct AcquireLockResponse {
    pub equipment_id: EquipmentId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub outcome: AcquireOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseLockResponse {
    pub equipment_id: EquipmentId,
    pub released: bool,
    /// Waiter granted the lease as a result of this release.
    pub promoted: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewLockResponse {
    pub equipment_id: EquipmentId,
    /// False means the lease was lost.
    pub renewed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelLockResponse {
    pub equipment_id: EquipmentId,
    pub cancelled: bool,
}

/// Administrative force release.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForceReleaseRequest {
    /// Who is forcing the release, for the event log.
    #[serde(default)]
    pub actor: Option<String>,
    /// Evict only this observer instead of clearing the record.
    #[serde(default)]
    pub observer: Option<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceReleaseResponse {
    pub equipment_id: EquipmentId,
    pub evicted: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListLocksResponse {
    pub locks: Vec<LockStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueResponse {
    pub equipment_id: EquipmentId,
    pub queue: Vec<QueueEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventsResponse {
    pub equipment_id: EquipmentId,
    pub events: Vec<LockEvent>,
}
