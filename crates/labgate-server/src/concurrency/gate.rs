//! Per-command permission checks.
//!
//! The [`PermissionGate`] is consulted once per equipment command dispatch.
//! It classifies the command and checks lock state. A successful check renews
//! the caller's lease and refreshes its session, so an actively commanding
//! session never loses either.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use labgate_core::{ArbitrationError, EquipmentId, SessionId};

use super::lock_manager::{LockManager, LockMode};
use super::session::SessionRegistry;

/// Commands that mutate instrument state and require an exclusive lease.
const CONTROL_COMMANDS: &[&str] = &[
    // oscilloscope
    "autoscale",
    "run",
    "stop",
    "single",
    "force_trigger",
    "clear_display",
    // power supply
    "output_on",
    "output_off",
    "enable_output",
    "disable_output",
    "apply",
    "clear_protection",
    // electronic load
    "input_on",
    "input_off",
    "enable_input",
    "disable_input",
    "short_on",
    "short_off",
    // any instrument
    "reset",
    "recall_state",
    "save_state",
    "calibrate",
];

/// Command name prefixes that always denote control.
const CONTROL_PREFIXES: &[&str] = &["set_", "configure_"];

/// How a command interacts with instrument state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandClass {
    /// Mutates the instrument.
    Control,
    /// Reads only.
    Observe,
}

/// Static classification of command names.
#[derive(Debug, Clone, Default)]
pub struct CommandClassifier {
    extra_control: HashSet<String>,
}

impl CommandClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds site-specific control commands on top of the built-in table.
    pub fn with_extra<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_control
            .extend(commands.into_iter().map(|c| c.into().to_ascii_lowercase()));
        self
    }

    pub fn classify(&self, command: &str) -> CommandClass {
        let command = command.trim().to_ascii_lowercase();
        let control = CONTROL_COMMANDS.contains(&command.as_str())
            || CONTROL_PREFIXES.iter().any(|p| command.starts_with(p))
            || self.extra_control.contains(&command);
        if control {
            CommandClass::Control
        } else {
            CommandClass::Observe
        }
    }
}

/// Maps command classification plus lock state to an allow/deny decision.
pub struct PermissionGate {
    classifier: CommandClassifier,
    locks: Arc<LockManager>,
    sessions: Arc<SessionRegistry>,
    enabled: bool,
}

impl PermissionGate {
    /// `enabled` is the global kill-switch; when false every check passes.
    pub fn new(
        classifier: CommandClassifier,
        locks: Arc<LockManager>,
        sessions: Arc<SessionRegistry>,
        enabled: bool,
    ) -> Self {
        PermissionGate {
            classifier,
            locks,
            sessions,
            enabled,
        }
    }

    pub fn classifier(&self) -> &CommandClassifier {
        &self.classifier
    }

    /// True if the session holds the exclusive lease, or locking is off.
    pub fn can_control(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        !self.enabled || self.locks.holds_exclusive(equipment_id, session_id)
    }

    /// True unless another session holds the exclusive lease.
    pub fn can_observe(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        !self.enabled || self.locks.observe_permitted(equipment_id, session_id)
    }

    /// Authorizes one command dispatch.
    pub fn check(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        command: &str,
    ) -> Result<CommandClass, ArbitrationError> {
        self.check_at(equipment_id, session_id, command, Instant::now())
    }

    pub fn check_at(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        command: &str,
        now: Instant,
    ) -> Result<CommandClass, ArbitrationError> {
        let class = self.classifier.classify(command);
        if !self.enabled {
            return Ok(class);
        }

        let required = match class {
            CommandClass::Control => LockMode::Exclusive,
            CommandClass::Observe => LockMode::Observe,
        };
        if !self.locks.authorize_at(equipment_id, session_id, required, now) {
            let reason = self.denial_reason(equipment_id, class);
            tracing::debug!(
                equipment_id = %equipment_id,
                session_id = %session_id,
                command,
                %reason,
                "command denied"
            );
            return Err(ArbitrationError::PermissionDenied {
                equipment_id: equipment_id.clone(),
                command: command.to_string(),
                reason,
            });
        }

        if let Err(e) = self.sessions.touch_at(session_id, now) {
            tracing::debug!(session_id = %session_id, error = %e, "command from unknown or expired session");
        }
        Ok(class)
    }

    fn denial_reason(&self, equipment_id: &EquipmentId, class: CommandClass) -> String {
        match self.locks.exclusive_holder(equipment_id) {
            Some(holder) => match self.sessions.label(&holder) {
                Some(label) => format!("equipment is locked by {holder} ({label})"),
                None => format!("equipment is locked by {holder}"),
            },
            None if class == CommandClass::Control => {
                "an exclusive lock is required for control commands".to_string()
            }
            None => "equipment is not available".to_string(),
        }
    }
}
