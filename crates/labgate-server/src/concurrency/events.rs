//! Lock transition events and bounded per-equipment history.
//!
//! Every state change in [`LockManager`](super::lock_manager::LockManager)
//! produces an immutable [`LockEvent`]. Events are appended to a capped
//! [`EventHistory`] on the equipment record and fanned out on a
//! `tokio::sync::broadcast` channel so that queued clients learn about their
//! promotion without polling.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use labgate_core::{EquipmentId, SessionId};

use super::lock_manager::LockMode;

/// Default broadcast buffer for lock events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The kind of transition an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockEventKind {
    Acquired,
    Queued,
    Released,
    Expired,
    ForceReleased,
    Denied,
    Cancelled,
}

/// An immutable record of a lock transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEvent {
    pub kind: LockEventKind,
    pub equipment_id: EquipmentId,
    pub session_id: Option<SessionId>,
    pub mode: Option<LockMode>,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl LockEvent {
    pub fn new(kind: LockEventKind, equipment_id: EquipmentId) -> Self {
        LockEvent {
            kind,
            equipment_id,
            session_id: None,
            mode: None,
            timestamp: Utc::now(),
            reason: None,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether the event concerns the given session.
    pub fn involves(&self, session_id: &SessionId) -> bool {
        self.session_id.as_ref() == Some(session_id)
    }
}

/// Append-only event log that evicts its oldest entries past `limit`.
#[derive(Debug, Clone)]
pub struct EventHistory {
    entries: VecDeque<LockEvent>,
    limit: usize,
}

impl EventHistory {
    pub fn new(limit: usize) -> Self {
        EventHistory {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, event: LockEvent) {
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    /// Oldest-first copy of the retained events.
    pub fn snapshot(&self) -> Vec<LockEvent> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: LockEventKind, session: &str) -> LockEvent {
        LockEvent::new(kind, EquipmentId::from("scope-1")).with_session(SessionId::from(session))
    }

    #[test]
    fn history_evicts_oldest_past_limit() {
        let mut history = EventHistory::new(3);
        for s in ["a", "b", "c", "d", "e"] {
            history.push(event(LockEventKind::Acquired, s));
        }
        let sessions: Vec<_> = history
            .snapshot()
            .into_iter()
            .map(|e| e.session_id.unwrap().0)
            .collect();
        assert_eq!(sessions, vec!["c", "d", "e"]);
    }

    #[test]
    fn zero_limit_still_keeps_latest_event() {
        let mut history = EventHistory::new(0);
        history.push(event(LockEventKind::Queued, "a"));
        history.push(event(LockEventKind::Queued, "b"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn kind_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&LockEventKind::ForceReleased).unwrap();
        assert_eq!(json, "\"FORCE_RELEASED\"");
    }

    #[test]
    fn involves_matches_session() {
        let e = event(LockEventKind::Released, "s1");
        assert!(e.involves(&SessionId::from("s1")));
        assert!(!e.involves(&SessionId::from("s2")));
    }
}
