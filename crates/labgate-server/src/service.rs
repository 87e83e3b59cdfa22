//! ArbitrationService: the single entry point between callers and the
//! arbitration components.
//!
//! The command router, the transport disconnect hook and the HTTP handlers
//! all hold a clone of [`ArbitrationService`]. It owns explicit handles to
//! one lock manager, one session registry, one permission gate and one
//! cleanup scheduler; independent instances never share state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labgate_core::{ArbitrationConfig, ArbitrationError, EquipmentId, SessionId};

use crate::concurrency::{
    spawn_disconnect_listener, AcquireOutcome, CleanupScheduler, CommandClass,
    CommandClassifier, DisconnectHook, LockEvent, LockManager, LockMode, LockStatus,
    PermissionGate, QueueEntry, ReleaseOutcome, SessionInfo, SessionMetadata, SessionRegistry,
    SweepReport,
};
use crate::schema::sessions::HeartbeatResponse;

/// Handles to a running set of background tasks.
pub struct BackgroundTasks {
    pub disconnect_hook: DisconnectHook,
    pub handles: Vec<JoinHandle<()>>,
}

/// The arbitration subsystem behind one cloneable handle.
#[derive(Clone)]
pub struct ArbitrationService {
    config: Arc<ArbitrationConfig>,
    locks: Arc<LockManager>,
    sessions: Arc<SessionRegistry>,
    gate: Arc<PermissionGate>,
    cleanup: Arc<CleanupScheduler>,
}

impl ArbitrationService {
    /// Creates a service with the built-in command classification.
    pub fn new(config: ArbitrationConfig) -> Self {
        Self::with_classifier(config, CommandClassifier::new())
    }

    pub fn with_classifier(config: ArbitrationConfig, classifier: CommandClassifier) -> Self {
        let locks = Arc::new(LockManager::new(&config));
        let sessions = Arc::new(SessionRegistry::new(config.session_timeout(), locks.clone()));
        let gate = Arc::new(PermissionGate::new(
            classifier,
            locks.clone(),
            sessions.clone(),
            config.enable_equipment_locks,
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            locks.clone(),
            sessions.clone(),
            config.cleanup_interval(),
        ));

        ArbitrationService {
            config: Arc::new(config),
            locks,
            sessions,
            gate,
            cleanup,
        }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn cleanup(&self) -> &Arc<CleanupScheduler> {
        &self.cleanup
    }

    /// Starts the cleanup loop and the disconnect listener.
    pub fn spawn_background(&self, cancel: CancellationToken) -> BackgroundTasks {
        let cleanup = self.cleanup.clone().spawn(cancel.clone());
        let (disconnect_hook, listener) = spawn_disconnect_listener(
            self.sessions.clone(),
            self.config.auto_release_on_disconnect,
            cancel,
        );
        BackgroundTasks {
            disconnect_hook,
            handles: vec![cleanup, listener],
        }
    }

    // -- Sessions --

    pub fn create_session(
        &self,
        session_id: Option<SessionId>,
        metadata: SessionMetadata,
    ) -> Result<SessionInfo, ArbitrationError> {
        self.sessions.create(session_id, metadata)
    }

    /// Ends the session, releasing its leases and queue places.
    pub fn end_session(&self, session_id: &SessionId) -> Result<Vec<EquipmentId>, ArbitrationError> {
        self.sessions.end(session_id)
    }

    pub fn touch_session(&self, session_id: &SessionId) -> Result<SessionInfo, ArbitrationError> {
        self.sessions.touch(session_id)
    }

    /// Touches the session and renews every lease it holds.
    pub fn heartbeat(&self, session_id: &SessionId) -> Result<HeartbeatResponse, ArbitrationError> {
        let now = Instant::now();
        let session = self.sessions.touch_at(session_id, now)?;
        let renewed = self.locks.renew_session_at(session_id, now);
        tracing::debug!(session_id = %session_id, renewed = renewed.len(), "heartbeat");
        Ok(HeartbeatResponse { session, renewed })
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<SessionInfo, ArbitrationError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| ArbitrationError::SessionNotFound(session_id.clone()))
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list()
    }

    /// Sessions that are currently past their timeout. Does not end them.
    pub fn sweep(&self) -> Vec<SessionId> {
        self.sessions.sweep(Instant::now())
    }

    // -- Locks --

    /// Requests a lease for a live session.
    pub fn acquire(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        mode: LockMode,
        lease_timeout: Option<Duration>,
    ) -> Result<AcquireOutcome, ArbitrationError> {
        let now = Instant::now();
        self.sessions.with_live_at(session_id, now, || {
            self.locks
                .acquire_at(equipment_id, session_id, mode, lease_timeout, now)
        })
    }

    pub fn release(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> ReleaseOutcome {
        self.locks.release(equipment_id, session_id)
    }

    /// Renews the caller's lease. `false` means the lease was lost.
    pub fn renew(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        let renewed = self.locks.renew(equipment_id, session_id);
        if renewed {
            // A lease holder with an expired session is left for the sweep.
            let _ = self.sessions.touch(session_id);
        }
        renewed
    }

    pub fn cancel(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        self.locks.cancel(equipment_id, session_id)
    }

    pub fn force_release(&self, equipment_id: &EquipmentId, actor: &str) -> Vec<SessionId> {
        self.locks.force_release(equipment_id, actor)
    }

    pub fn force_release_observer(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        actor: &str,
    ) -> bool {
        self.locks.force_release_observer(equipment_id, session_id, actor)
    }

    pub fn status(&self, equipment_id: &EquipmentId) -> LockStatus {
        self.locks.status(equipment_id)
    }

    pub fn status_all(&self) -> Vec<LockStatus> {
        self.locks.status_all()
    }

    pub fn list_queue(&self, equipment_id: &EquipmentId) -> Vec<QueueEntry> {
        self.locks.list_queue(equipment_id)
    }

    pub fn list_events(&self, equipment_id: &EquipmentId) -> Vec<LockEvent> {
        self.locks.list_events(equipment_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.locks.subscribe()
    }

    // -- Permission gate --

    pub fn can_control(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        self.gate.can_control(equipment_id, session_id)
    }

    pub fn can_observe(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        self.gate.can_observe(equipment_id, session_id)
    }

    /// Runs the permission gate for one command dispatch.
    pub fn authorize(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        command: &str,
    ) -> Result<CommandClass, ArbitrationError> {
        self.gate.check(equipment_id, session_id, command)
    }

    // -- Cleanup --

    pub fn run_cleanup_once(&self) -> SweepReport {
        self.cleanup.run_once()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::EquipmentMode;

    fn service() -> ArbitrationService {
        ArbitrationService::new(ArbitrationConfig::default())
    }

    #[test]
    fn acquire_requires_a_live_session() {
        let svc = service();
        let err = svc
            .acquire(&EquipmentId::from("scope-1"), &SessionId::from("nobody"), LockMode::Exclusive, None)
            .unwrap_err();
        assert_eq!(err, ArbitrationError::SessionNotFound(SessionId::from("nobody")));
        assert_eq!(svc.status(&EquipmentId::from("scope-1")).mode, EquipmentMode::None);
    }

    #[test]
    fn heartbeat_renews_held_leases() {
        let svc = service();
        let id = svc.create_session(None, SessionMetadata::default()).unwrap().session_id;
        let scope = EquipmentId::from("scope-1");
        svc.acquire(&scope, &id, LockMode::Exclusive, None).unwrap();

        let beat = svc.heartbeat(&id).unwrap();
        assert_eq!(beat.renewed, vec![scope]);
        assert_eq!(beat.session.session_id, id);
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = service();
        let b = service();
        let id = SessionId::from("s1");
        a.create_session(Some(id.clone()), SessionMetadata::default()).unwrap();
        assert!(b.get_session(&id).is_err());
        b.create_session(Some(id), SessionMetadata::default()).unwrap();
    }
}
