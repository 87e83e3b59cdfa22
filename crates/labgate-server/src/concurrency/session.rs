//! Client session lifecycle.
//!
//! [`SessionRegistry`] tracks connected clients by [`SessionId`]. A session
//! bounds the lifetime of every lease it holds: ending a session, explicitly
//! or by idle timeout, releases its leases and purges it from every wait
//! queue through the injected [`LockManager`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use labgate_core::{ArbitrationError, EquipmentId, SessionId};

use super::events::LockEventKind;
use super::lock_manager::LockManager;
use super::{as_millis, wall_clock};

/// Client-supplied description of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Human-readable client name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Client role, e.g. "operator" or "viewer".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl SessionMetadata {
    /// Short "name, role" label used in denial messages.
    pub fn label(&self) -> Option<String> {
        match (&self.name, &self.role) {
            (Some(name), Some(role)) => Some(format!("{name}, {role}")),
            (Some(name), None) => Some(name.clone()),
            (None, Some(role)) => Some(role.clone()),
            (None, None) => None,
        }
    }
}

/// A live client session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub metadata: SessionMetadata,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: SessionId, metadata: SessionMetadata, now: Instant) -> Self {
        Session {
            id,
            metadata,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    fn info(&self, now: Instant, now_utc: DateTime<Utc>, timeout: Duration) -> SessionInfo {
        let idle = now.saturating_duration_since(self.last_activity);
        SessionInfo {
            session_id: self.id.clone(),
            metadata: self.metadata.clone(),
            created_at: wall_clock(self.created_at, now, now_utc),
            last_activity: wall_clock(self.last_activity, now, now_utc),
            idle_ms: as_millis(idle),
            expires_in_ms: as_millis(timeout.saturating_sub(idle)),
        }
    }
}

/// Read-only view of a session returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_ms: u64,
    pub expires_in_ms: u64,
}

/// Registry of live client sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    timeout: Duration,
    locks: Arc<LockManager>,
}

impl SessionRegistry {
    pub fn new(timeout: Duration, locks: Arc<LockManager>) -> Self {
        SessionRegistry {
            sessions: DashMap::new(),
            timeout,
            locks,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registers a session, generating an id when none is supplied.
    ///
    /// Fails with `DuplicateSession` if the id belongs to a live session. An
    /// expired session with the same id is ended first and then replaced.
    pub fn create(
        &self,
        session_id: Option<SessionId>,
        metadata: SessionMetadata,
    ) -> Result<SessionInfo, ArbitrationError> {
        self.create_at(session_id, metadata, Instant::now())
    }

    pub fn create_at(
        &self,
        session_id: Option<SessionId>,
        metadata: SessionMetadata,
        now: Instant,
    ) -> Result<SessionInfo, ArbitrationError> {
        let id = session_id.unwrap_or_else(SessionId::generate);
        let session = Session::new(id.clone(), metadata, now);
        let info = session.info(now, Utc::now(), self.timeout);

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now, self.timeout) {
                    return Err(ArbitrationError::DuplicateSession(id));
                }
                self.locks
                    .release_session_at(&id, LockEventKind::Expired, "session expired", now);
                occupied.insert(session);
                tracing::info!(session_id = %id, "expired session replaced");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(session);
                tracing::info!(session_id = %id, "session created");
            }
        }
        Ok(info)
    }

    /// Ends a session and releases everything it holds or waits for.
    ///
    /// Returns the equipment ids whose leases were released.
    pub fn end(&self, session_id: &SessionId) -> Result<Vec<EquipmentId>, ArbitrationError> {
        self.end_at(session_id, Instant::now())
    }

    pub fn end_at(
        &self,
        session_id: &SessionId,
        now: Instant,
    ) -> Result<Vec<EquipmentId>, ArbitrationError> {
        // Released under the entry guard: `with_live_at` cannot grant a lease
        // to a session mid-teardown.
        let Entry::Occupied(occupied) = self.sessions.entry(session_id.clone()) else {
            return Err(ArbitrationError::SessionNotFound(session_id.clone()));
        };
        let released =
            self.locks
                .release_session_at(session_id, LockEventKind::Released, "session ended", now);
        occupied.remove();
        tracing::info!(session_id = %session_id, released = released.len(), "session ended");
        Ok(released)
    }

    /// Ends the session only if it is still expired at `now`.
    ///
    /// Returns `None` when a touch got there first or the session is gone.
    pub fn end_expired_at(&self, session_id: &SessionId, now: Instant) -> Option<Vec<EquipmentId>> {
        let Entry::Occupied(occupied) = self.sessions.entry(session_id.clone()) else {
            return None;
        };
        if !occupied.get().is_expired(now, self.timeout) {
            return None;
        }
        let released =
            self.locks
                .release_session_at(session_id, LockEventKind::Expired, "session expired", now);
        occupied.remove();
        tracing::info!(session_id = %session_id, released = released.len(), "session expired");
        Some(released)
    }

    /// Refreshes the session's liveness timestamp.
    pub fn touch(&self, session_id: &SessionId) -> Result<SessionInfo, ArbitrationError> {
        self.touch_at(session_id, Instant::now())
    }

    pub fn touch_at(&self, session_id: &SessionId, now: Instant) -> Result<SessionInfo, ArbitrationError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ArbitrationError::SessionNotFound(session_id.clone()))?;
        // An expired session is left for the sweep to end.
        if session.is_expired(now, self.timeout) {
            return Err(ArbitrationError::SessionNotFound(session_id.clone()));
        }
        session.last_activity = now;
        Ok(session.info(now, Utc::now(), self.timeout))
    }

    /// Touches the session and runs `f` while its entry is held.
    ///
    /// A concurrent `end` either finishes before `f` (which then never runs)
    /// or waits for `f` and releases whatever it acquired. `f` must not call
    /// back into the registry.
    pub fn with_live_at<T>(
        &self,
        session_id: &SessionId,
        now: Instant,
        f: impl FnOnce() -> T,
    ) -> Result<T, ArbitrationError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ArbitrationError::SessionNotFound(session_id.clone()))?;
        if session.is_expired(now, self.timeout) {
            return Err(ArbitrationError::SessionNotFound(session_id.clone()));
        }
        session.last_activity = now;
        Ok(f())
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.sessions
            .get(session_id)
            .map(|session| session.info(Instant::now(), Utc::now(), self.timeout))
    }

    /// All registered sessions, sorted by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info(now, now_utc, self.timeout))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Sessions idle longer than the session timeout at `now`. Pure read.
    pub fn sweep(&self, now: Instant) -> Vec<SessionId> {
        let mut expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now, self.timeout))
            .map(|entry| entry.key().clone())
            .collect();
        expired.sort();
        expired
    }

    /// Display label ("name, role") for the session, if it has one.
    pub fn label(&self, session_id: &SessionId) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|session| session.metadata.label())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock_manager::{EquipmentMode, LockMode};

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn registry() -> (SessionRegistry, Arc<LockManager>) {
        let locks = Arc::new(LockManager::with_default_config());
        (SessionRegistry::new(TIMEOUT, locks.clone()), locks)
    }

    fn operator(name: &str) -> SessionMetadata {
        SessionMetadata {
            name: Some(name.to_string()),
            role: Some("operator".to_string()),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn create_generates_id_when_absent() {
        let (sessions, _) = registry();
        let a = sessions.create(None, SessionMetadata::default()).unwrap();
        let b = sessions.create(None, SessionMetadata::default()).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn duplicate_live_session_is_rejected() {
        let (sessions, _) = registry();
        let id = SessionId::from("bench-1");
        sessions.create(Some(id.clone()), operator("alice")).unwrap();
        let err = sessions.create(Some(id.clone()), operator("bob")).unwrap_err();
        assert_eq!(err, ArbitrationError::DuplicateSession(id));
    }

    #[test]
    fn expired_session_id_can_be_reused_and_its_leases_are_dropped() {
        let (sessions, locks) = registry();
        let t0 = Instant::now();
        let id = SessionId::from("bench-1");
        let scope = EquipmentId::from("scope-1");
        sessions.create_at(Some(id.clone()), operator("alice"), t0).unwrap();
        locks.acquire_at(&scope, &id, LockMode::Exclusive, Some(Duration::from_secs(600)), t0);

        let later = t0 + TIMEOUT + Duration::from_secs(1);
        let info = sessions.create_at(Some(id.clone()), operator("bob"), later).unwrap();
        assert_eq!(info.metadata.name.as_deref(), Some("bob"));
        assert_eq!(locks.status_at(&scope, later).mode, EquipmentMode::None);
    }

    #[test]
    fn end_releases_held_leases() {
        let (sessions, locks) = registry();
        let id = sessions.create(None, SessionMetadata::default()).unwrap().session_id;
        let psu = EquipmentId::from("psu-1");
        locks.acquire(&psu, &id, LockMode::Observe, None);

        assert_eq!(sessions.end(&id).unwrap(), vec![psu.clone()]);
        assert_eq!(locks.status(&psu).mode, EquipmentMode::None);
        assert_eq!(
            sessions.end(&id).unwrap_err(),
            ArbitrationError::SessionNotFound(id)
        );
    }

    #[test]
    fn touch_refreshes_and_rejects_expired() {
        let (sessions, _) = registry();
        let t0 = Instant::now();
        let id = sessions
            .create_at(None, SessionMetadata::default(), t0)
            .unwrap()
            .session_id;

        let info = sessions.touch_at(&id, t0 + Duration::from_secs(50)).unwrap();
        assert_eq!(info.idle_ms, 0);
        assert!(sessions.sweep(t0 + Duration::from_secs(100)).is_empty());

        let late = t0 + Duration::from_secs(200);
        assert!(matches!(
            sessions.touch_at(&id, late),
            Err(ArbitrationError::SessionNotFound(_))
        ));
        assert_eq!(sessions.sweep(late), vec![id]);
    }

    #[test]
    fn end_expired_skips_sessions_touched_in_between() {
        let (sessions, _) = registry();
        let t0 = Instant::now();
        let id = sessions
            .create_at(None, SessionMetadata::default(), t0)
            .unwrap()
            .session_id;
        let check = t0 + Duration::from_secs(61);
        sessions.touch_at(&id, t0 + Duration::from_secs(30)).unwrap();
        assert!(sessions.end_expired_at(&id, check).is_none());
        assert_eq!(sessions.len(), 1);

        assert!(sessions
            .end_expired_at(&id, t0 + Duration::from_secs(120))
            .is_some());
        assert!(sessions.is_empty());
    }

    #[test]
    fn label_combines_name_and_role() {
        let (sessions, _) = registry();
        let id = sessions.create(None, operator("alice")).unwrap().session_id;
        assert_eq!(sessions.label(&id).as_deref(), Some("alice, operator"));

        let anonymous = sessions.create(None, SessionMetadata::default()).unwrap().session_id;
        assert_eq!(sessions.label(&anonymous), None);
    }

    #[test]
    fn list_is_sorted_by_id() {
        let (sessions, _) = registry();
        for id in ["c", "a", "b"] {
            sessions
                .create(Some(SessionId::from(id)), SessionMetadata::default())
                .unwrap();
        }
        let ids: Vec<_> = sessions.list().into_iter().map(|s| s.session_id.0).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
