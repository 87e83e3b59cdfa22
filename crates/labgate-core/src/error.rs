//! Arbitration error types for labgate-core.
//!
//! Every variant is an expected, recoverable outcome returned to the caller.
//! None of them indicate a fault in the arbitration state itself. Lock
//! denials are not errors: they travel as `Denied` acquire outcomes.

use crate::id::{EquipmentId, SessionId};
use thiserror::Error;

/// Errors produced by the arbitration subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbitrationError {
    /// The session is unknown or has already expired.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A live session with the supplied identifier already exists.
    #[error("duplicate session: {0}")]
    DuplicateSession(SessionId),

    /// The caller lacks the lock mode the command requires.
    #[error("permission denied for '{command}' on {equipment_id}: {reason}")]
    PermissionDenied {
        equipment_id: EquipmentId,
        command: String,
        reason: String,
    },

    /// A configuration value could not be used.
    #[error("invalid configuration {key}: {reason}")]
    InvalidConfig { key: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_message_names_the_holder() {
        let err = ArbitrationError::PermissionDenied {
            equipment_id: EquipmentId::from("scope-1"),
            command: "set_timebase".to_string(),
            reason: "equipment is locked by s1 (alice, operator)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "permission denied for 'set_timebase' on scope-1: equipment is locked by s1 (alice, operator)"
        );
    }

    #[test]
    fn duplicate_session_message() {
        let err = ArbitrationError::DuplicateSession(SessionId::from("bench-1"));
        assert_eq!(err.to_string(), "duplicate session: bench-1");
    }
}
