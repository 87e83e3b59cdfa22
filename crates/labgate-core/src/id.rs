//! Identifier newtypes for arbitration entities.
//!
//! Session and equipment identifiers are both opaque strings, but they are
//! distinct newtypes so that a `SessionId` cannot be accidentally used where
//! an `EquipmentId` is expected.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client session identifier. Caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

/// Instrument identifier (e.g. `scope-1`, `psu-1`, `load-1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EquipmentId(pub String);

impl SessionId {
    /// Generates a fresh random session identifier (UUID v4 text).
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl EquipmentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

impl From<&str> for EquipmentId {
    fn from(s: &str) -> Self {
        EquipmentId(s.to_string())
    }
}

impl From<String> for EquipmentId {
    fn from(s: String) -> Self {
        EquipmentId(s)
    }
}
