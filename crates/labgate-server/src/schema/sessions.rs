//! Schema types for session management API.

use serde::{Deserialize, Serialize};

use labgate_core::{EquipmentId, SessionId};

use crate::concurrency::{SessionInfo, SessionMetadata};

/// Request to open a session. All fields are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

/// Response after ending a session.
#[derive(Debug, Clone, Serialize)]
pub struct EndSessionResponse {
    pub session_id: SessionId,
    /// Equipment whose leases were released.
    pub released: Vec<EquipmentId>,
}

/// Response to a heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub session: SessionInfo,
    /// Equipment whose leases were renewed.
    pub renewed: Vec<EquipmentId>,
}
