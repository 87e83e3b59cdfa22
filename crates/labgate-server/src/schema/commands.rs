//! Schema types for command authorization.

use serde::{Deserialize, Serialize};

use labgate_core::{EquipmentId, SessionId};

use crate::concurrency::CommandClass;

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeCommandRequest {
    /// Instrument command name, e.g. "set_voltage".
    pub command: String,
}

/// Returned when the command may be dispatched.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeCommandResponse {
    pub equipment_id: EquipmentId,
    pub session_id: SessionId,
    pub command: String,
    pub class: CommandClass,
    pub allowed: bool,
}
