//! Periodic lease and session expiry.
//!
//! The sweep goes through the same release primitives as the synchronous
//! API: stale leases are released with an `EXPIRED` event and queue
//! promotion, then expired sessions are ended, cascading into their leases.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use labgate_core::SessionId;

use super::as_millis;
use super::lock_manager::{ExpiredLease, LockManager};
use super::session::SessionRegistry;

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_leases: Vec<ExpiredLease>,
    pub expired_sessions: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_leases.is_empty() && self.expired_sessions.is_empty()
    }
}

pub struct CleanupScheduler {
    locks: Arc<LockManager>,
    sessions: Arc<SessionRegistry>,
    interval: Duration,
}

impl CleanupScheduler {
    pub fn new(locks: Arc<LockManager>, sessions: Arc<SessionRegistry>, interval: Duration) -> Self {
        CleanupScheduler {
            locks,
            sessions,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn run_once(&self) -> SweepReport {
        self.run_once_at(Instant::now())
    }

    /// Runs one sweep as of `now`. Idempotent.
    pub fn run_once_at(&self, now: Instant) -> SweepReport {
        let expired_leases = self.locks.expire_stale_at(now);

        let expired_sessions: Vec<SessionId> = self
            .sessions
            .sweep(now)
            .into_iter()
            .filter(|id| self.sessions.end_expired_at(id, now).is_some())
            .collect();

        let report = SweepReport {
            expired_leases,
            expired_sessions,
        };
        if report.is_empty() {
            tracing::debug!("cleanup sweep: nothing expired");
        } else {
            tracing::info!(
                leases = report.expired_leases.len(),
                sessions = report.expired_sessions.len(),
                "cleanup sweep expired entries"
            );
        }
        report
    }

    /// Runs the sweep on a fixed interval until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_ms = as_millis(self.interval), "cleanup scheduler started");
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("cleanup scheduler stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_once();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::lock_manager::{EquipmentMode, LockMode};
    use crate::concurrency::session::SessionMetadata;
    use labgate_core::EquipmentId;

    fn scheduler(session_timeout: Duration) -> CleanupScheduler {
        let locks = Arc::new(LockManager::with_default_config());
        let sessions = Arc::new(SessionRegistry::new(session_timeout, locks.clone()));
        CleanupScheduler::new(locks, sessions, Duration::from_millis(100))
    }

    #[test]
    fn expired_lease_is_released_and_reported() {
        let cleanup = scheduler(Duration::from_secs(600));
        let t0 = Instant::now();
        let load = EquipmentId::from("load-1");
        let s1 = SessionId::from("s1");
        cleanup
            .locks
            .acquire_at(&load, &s1, LockMode::Exclusive, Some(Duration::from_secs(30)), t0);

        let report = cleanup.run_once_at(t0 + Duration::from_secs(31));
        assert_eq!(report.expired_leases.len(), 1);
        assert_eq!(report.expired_leases[0].session_id, s1);
        assert_eq!(cleanup.locks.status(&load).mode, EquipmentMode::None);

        assert!(cleanup.run_once_at(t0 + Duration::from_secs(32)).is_empty());
    }

    #[test]
    fn expired_session_is_ended_with_its_leases() {
        let cleanup = scheduler(Duration::from_secs(60));
        let t0 = Instant::now();
        let id = cleanup
            .sessions
            .create_at(None, SessionMetadata::default(), t0)
            .unwrap()
            .session_id;
        let psu = EquipmentId::from("psu-1");
        cleanup
            .locks
            .acquire_at(&psu, &id, LockMode::Observe, Some(Duration::from_secs(3600)), t0);

        let report = cleanup.run_once_at(t0 + Duration::from_secs(61));
        assert!(report.expired_leases.is_empty());
        assert_eq!(report.expired_sessions, vec![id]);
        assert!(cleanup.sessions.is_empty());
        assert_eq!(cleanup.locks.status(&psu).mode, EquipmentMode::None);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let cleanup = Arc::new(scheduler(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let handle = cleanup.clone().spawn(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
