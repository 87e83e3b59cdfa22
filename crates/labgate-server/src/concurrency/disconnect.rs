//! Transport disconnect delivery.
//!
//! The transport reports a dropped client by sending its [`SessionId`] on a
//! [`DisconnectHook`]. A listener task turns each message into a session end
//! when `auto_release_on_disconnect` is on; otherwise it only logs.
//!
//! A session may have several transport connections open. Each one is
//! registered with [`DisconnectHook::attach`], and only the close of the last
//! one is delivered.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labgate_core::{ArbitrationError, EquipmentId, SessionId};

use super::session::SessionRegistry;

/// Sender half handed to the transport layer.
#[derive(Debug, Clone)]
pub struct DisconnectHook {
    tx: mpsc::UnboundedSender<SessionId>,
    connections: Arc<DashMap<SessionId, usize>>,
}

impl DisconnectHook {
    fn channel() -> (Self, mpsc::UnboundedReceiver<SessionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hook = DisconnectHook {
            tx,
            connections: Arc::new(DashMap::new()),
        };
        (hook, rx)
    }

    /// Registers an open connection for the session. Returns how many are open.
    pub fn attach(&self, session_id: &SessionId) -> usize {
        let mut open = self.connections.entry(session_id.clone()).or_insert(0);
        *open += 1;
        *open
    }

    /// Reports a closed connection.
    ///
    /// The session is delivered to the listener only when no other attached
    /// connection remains. Sessions never attached are delivered at once.
    /// Dropped if the listener is gone.
    pub fn notify(&self, session_id: SessionId) {
        let remaining = match self.connections.entry(session_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let open = occupied.get_mut();
                *open = open.saturating_sub(1);
                let remaining = *open;
                if remaining == 0 {
                    occupied.remove();
                }
                remaining
            }
            Entry::Vacant(_) => 0,
        };
        if remaining > 0 {
            tracing::debug!(session_id = %session_id, remaining, "connection closed; session still connected");
            return;
        }
        if let Err(e) = self.tx.send(session_id) {
            tracing::warn!(session_id = %e.0, "disconnect listener gone, message dropped");
        }
    }
}

/// Applies one disconnect message.
///
/// Returns the released equipment ids, or `None` when auto-release is off.
pub fn handle_disconnect(
    sessions: &SessionRegistry,
    session_id: &SessionId,
    auto_release: bool,
) -> Option<Result<Vec<EquipmentId>, ArbitrationError>> {
    if !auto_release {
        tracing::info!(session_id = %session_id, "client disconnected; auto-release disabled");
        return None;
    }
    let result = sessions.end(session_id);
    match &result {
        Ok(released) => tracing::info!(
            session_id = %session_id,
            released = released.len(),
            "client disconnected; session ended"
        ),
        Err(e) => tracing::debug!(session_id = %session_id, error = %e, "disconnect for unknown session"),
    }
    Some(result)
}

/// Spawns the listener and returns the hook feeding it.
pub fn spawn_disconnect_listener(
    sessions: Arc<SessionRegistry>,
    auto_release: bool,
    cancel: CancellationToken,
) -> (DisconnectHook, JoinHandle<()>) {
    let (hook, mut rx) = DisconnectHook::channel();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(session_id) => {
                        handle_disconnect(&sessions, &session_id, auto_release);
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("disconnect listener stopped");
    });

    (hook, handle)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::concurrency::lock_manager::{EquipmentMode, LockManager, LockMode};
    use crate::concurrency::session::SessionMetadata;

    fn registry() -> (Arc<SessionRegistry>, Arc<LockManager>) {
        let locks = Arc::new(LockManager::with_default_config());
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(600), locks.clone()));
        (sessions, locks)
    }

    #[test]
    fn auto_release_off_keeps_session() {
        let (sessions, _) = registry();
        let id = sessions.create(None, SessionMetadata::default()).unwrap().session_id;
        assert!(handle_disconnect(&sessions, &id, false).is_none());
        assert!(sessions.get(&id).is_some());
    }

    #[tokio::test]
    async fn listener_ends_session_and_releases_locks() {
        let (sessions, locks) = registry();
        let id = sessions.create(None, SessionMetadata::default()).unwrap().session_id;
        let scope = EquipmentId::from("scope-1");
        locks.acquire(&scope, &id, LockMode::Exclusive, None);

        let cancel = CancellationToken::new();
        let (hook, handle) = spawn_disconnect_listener(sessions.clone(), true, cancel.clone());
        hook.notify(id.clone());
        drop(hook);
        handle.await.unwrap();

        assert!(sessions.get(&id).is_none());
        assert_eq!(locks.status(&scope).mode, EquipmentMode::None);
    }

    #[test]
    fn only_the_last_connection_close_is_delivered() {
        let (hook, mut rx) = DisconnectHook::channel();
        let id = SessionId::from("bench-1");
        assert_eq!(hook.attach(&id), 1);
        assert_eq!(hook.attach(&id), 2);

        hook.notify(id.clone());
        assert!(rx.try_recv().is_err());

        hook.notify(id.clone());
        assert_eq!(rx.try_recv().unwrap(), id);
    }

    #[test]
    fn unattached_session_is_delivered_immediately() {
        let (hook, mut rx) = DisconnectHook::channel();
        hook.notify(SessionId::from("bench-2"));
        assert_eq!(rx.try_recv().unwrap(), SessionId::from("bench-2"));
    }
}
