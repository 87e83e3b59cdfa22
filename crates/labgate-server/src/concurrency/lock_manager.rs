//! Per-equipment lease lock manager.
//!
//! [`LockManager`] arbitrates instrument access with exclusive (single
//! writer) and observe (shared reader) leases, a FIFO wait queue behind the
//! exclusive holder, and lease expiry driven by the cleanup sweep.
//!
//! Each equipment record is guarded by its `DashMap` entry, so operations on
//! different instruments never serialize behind one global lock. Expiry,
//! session teardown and explicit release all funnel through the same
//! `release_lease` transition and differ only in the event kind they emit.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use labgate_core::{ArbitrationConfig, EquipmentId, SessionId};

use super::events::{EventHistory, LockEvent, LockEventKind, EVENT_CHANNEL_CAPACITY};
use super::{as_millis, wall_clock};

/// Requested lock mode: exclusive (single writer) or observe (shared).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Exclusive,
    Observe,
}

/// Mode an equipment record is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentMode {
    None,
    Observe,
    Exclusive,
}

/// A time-bounded grant held by one session.
#[derive(Debug, Clone)]
pub struct Lease {
    pub session_id: SessionId,
    pub acquired_at: Instant,
    pub last_activity: Instant,
    pub timeout: Duration,
}

impl Lease {
    fn new(session_id: SessionId, now: Instant, timeout: Duration) -> Self {
        Lease {
            session_id,
            acquired_at: now,
            last_activity: now,
            timeout,
        }
    }

    /// True once `now - last_activity` exceeds the lease timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.timeout
            .saturating_sub(now.saturating_duration_since(self.last_activity))
    }
}

/// A pending exclusive request.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub session_id: SessionId,
    pub requested_at: Instant,
    pub requested_timeout: Duration,
}

/// Per-equipment lock state.
///
/// The exclusive variant carries exactly one holder, and the wait queue
/// exists only behind an exclusive holder. The observed variant always has
/// at least one observer; the last observer leaving moves it to `Unlocked`.
#[derive(Debug)]
pub enum EquipmentLockState {
    /// No lease held.
    Unlocked,
    /// Shared observe leases held by one or more sessions.
    Observed { observers: HashMap<SessionId, Lease> },
    /// Exclusive lease held by one session.
    Exclusive {
        holder: Lease,
        /// Pending exclusive requests, in FIFO order.
        waiters: VecDeque<QueuedRequest>,
    },
}

impl EquipmentLockState {
    pub fn mode(&self) -> EquipmentMode {
        match self {
            EquipmentLockState::Unlocked => EquipmentMode::None,
            EquipmentLockState::Observed { .. } => EquipmentMode::Observe,
            EquipmentLockState::Exclusive { .. } => EquipmentMode::Exclusive,
        }
    }

    fn lease(&self, session_id: &SessionId) -> Option<&Lease> {
        match self {
            EquipmentLockState::Unlocked => None,
            EquipmentLockState::Observed { observers } => observers.get(session_id),
            EquipmentLockState::Exclusive { holder, .. } => {
                (holder.session_id == *session_id).then_some(holder)
            }
        }
    }

    fn lease_mut(&mut self, session_id: &SessionId) -> Option<&mut Lease> {
        match self {
            EquipmentLockState::Unlocked => None,
            EquipmentLockState::Observed { observers } => observers.get_mut(session_id),
            EquipmentLockState::Exclusive { holder, .. } => {
                (holder.session_id == *session_id).then_some(holder)
            }
        }
    }

    /// Whether the session holds a lease or waits in the queue.
    fn involves(&self, session_id: &SessionId) -> bool {
        if self.lease(session_id).is_some() {
            return true;
        }
        match self {
            EquipmentLockState::Exclusive { waiters, .. } => {
                waiters.iter().any(|w| w.session_id == *session_id)
            }
            _ => false,
        }
    }

    fn expired_sessions(&self, now: Instant) -> Vec<SessionId> {
        match self {
            EquipmentLockState::Unlocked => Vec::new(),
            EquipmentLockState::Observed { observers } => observers
                .values()
                .filter(|lease| lease.is_expired(now))
                .map(|lease| lease.session_id.clone())
                .collect(),
            EquipmentLockState::Exclusive { holder, .. } => {
                if holder.is_expired(now) {
                    vec![holder.session_id.clone()]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

/// Arbitration record for one equipment id. Never deleted, only reset.
#[derive(Debug)]
struct EquipmentRecord {
    state: EquipmentLockState,
    history: EventHistory,
}

impl EquipmentRecord {
    fn new(history_limit: usize) -> Self {
        EquipmentRecord {
            state: EquipmentLockState::Unlocked,
            history: EventHistory::new(history_limit),
        }
    }
}

/// Result of an acquire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum AcquireOutcome {
    /// The lease is held. `renewed` marks an idempotent re-acquire.
    Granted {
        mode: LockMode,
        renewed: bool,
        lease_timeout_ms: u64,
    },
    /// The request waits behind `holder` at 1-based `position`.
    Queued { position: usize, holder: SessionId },
    Denied { reason: DenialReason },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted { .. })
    }
}

/// Why an acquire request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    /// Another session holds the exclusive lease.
    HeldExclusive { holder: SessionId },
    /// Other sessions hold observe leases; they are never evicted.
    Observed { observers: Vec<SessionId> },
    /// The request would have queued but queueing is disabled.
    QueueDisabled { holder: SessionId },
    ObserverModeDisabled,
}

impl DenialReason {
    pub fn describe(&self) -> String {
        match self {
            DenialReason::HeldExclusive { holder } => format!("equipment is locked by {holder}"),
            DenialReason::Observed { observers } => format!(
                "equipment is observed by {} session(s): {}",
                observers.len(),
                observers
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            DenialReason::QueueDisabled { holder } => {
                format!("equipment is locked by {holder} and the lock queue is disabled")
            }
            DenialReason::ObserverModeDisabled => "observer mode is disabled".to_string(),
        }
    }
}

/// Result of a release request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// The lease was dropped; `promoted` is the waiter granted next, if any.
    Released { promoted: Option<SessionId> },
    /// The caller held nothing. A `DENIED` diagnostic event was recorded.
    NotHeld,
}

/// A lease removed by the expiry sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredLease {
    pub equipment_id: EquipmentId,
    pub session_id: SessionId,
    pub promoted: Option<SessionId>,
}

/// Status view of a single lease holder.
#[derive(Debug, Clone, Serialize)]
pub struct HolderStatus {
    pub session_id: SessionId,
    pub acquired_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub lease_timeout_ms: u64,
    pub lease_remaining_ms: u64,
}

/// Status view of a queued request.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    /// 1-based position in the wait queue.
    pub position: usize,
    pub session_id: SessionId,
    pub requested_at: DateTime<Utc>,
    pub requested_timeout_ms: u64,
}

/// Side-effect-free snapshot of one equipment record.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub equipment_id: EquipmentId,
    pub mode: EquipmentMode,
    pub holders: Vec<HolderStatus>,
    /// Time until the record falls idle without renewal.
    pub lease_remaining_ms: Option<u64>,
    pub queue_depth: usize,
    pub queue: Vec<QueueEntry>,
}

/// Per-equipment lease lock manager.
///
/// Uses `DashMap` for concurrent access; all mutation of one equipment id
/// happens under that id's entry guard.
pub struct LockManager {
    records: DashMap<EquipmentId, EquipmentRecord>,
    events: broadcast::Sender<LockEvent>,
    default_lease: Duration,
    queue_enabled: bool,
    observer_mode_enabled: bool,
    history_limit: usize,
}

impl LockManager {
    /// Creates a lock manager from the arbitration settings.
    pub fn new(config: &ArbitrationConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        LockManager {
            records: DashMap::new(),
            events,
            default_lease: config.lock_timeout(),
            queue_enabled: config.enable_lock_queue,
            observer_mode_enabled: config.enable_observer_mode,
            history_limit: config.event_history_limit,
        }
    }

    /// Creates a lock manager with the default settings.
    pub fn with_default_config() -> Self {
        Self::new(&ArbitrationConfig::default())
    }

    pub fn default_lease(&self) -> Duration {
        self.default_lease
    }

    /// Subscribes to every lock event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    fn emit(&self, history: &mut EventHistory, event: LockEvent) {
        history.push(event.clone());
        // A send error only means nobody is subscribed.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, history: &mut EventHistory, events: Vec<LockEvent>) {
        for event in events {
            self.emit(history, event);
        }
    }

    /// Requests a lease. Never blocks: grants, queues or denies immediately.
    pub fn acquire(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        mode: LockMode,
        lease_timeout: Option<Duration>,
    ) -> AcquireOutcome {
        self.acquire_at(equipment_id, session_id, mode, lease_timeout, Instant::now())
    }

    pub fn acquire_at(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        mode: LockMode,
        lease_timeout: Option<Duration>,
        now: Instant,
    ) -> AcquireOutcome {
        let timeout = lease_timeout.unwrap_or(self.default_lease);

        let mut entry = self
            .records
            .entry(equipment_id.clone())
            .or_insert_with(|| EquipmentRecord::new(self.history_limit));
        let EquipmentRecord { state, history } = &mut *entry;

        let mut events = Vec::new();
        let outcome = match mode {
            LockMode::Observe => {
                self.acquire_observe(equipment_id, state, session_id, timeout, now, &mut events)
            }
            LockMode::Exclusive => {
                self.acquire_exclusive(equipment_id, state, session_id, timeout, now, &mut events)
            }
        };
        self.emit_all(history, events);

        match &outcome {
            AcquireOutcome::Granted { mode, renewed, .. } => tracing::info!(
                equipment_id = %equipment_id,
                session_id = %session_id,
                ?mode,
                renewed,
                "lock granted"
            ),
            AcquireOutcome::Queued { position, .. } => tracing::debug!(
                equipment_id = %equipment_id,
                session_id = %session_id,
                position,
                "lock request queued"
            ),
            AcquireOutcome::Denied { reason } => tracing::debug!(
                equipment_id = %equipment_id,
                session_id = %session_id,
                reason = %reason.describe(),
                "lock request denied"
            ),
        }
        outcome
    }

    fn acquire_observe(
        &self,
        equipment_id: &EquipmentId,
        state: &mut EquipmentLockState,
        session_id: &SessionId,
        timeout: Duration,
        now: Instant,
        events: &mut Vec<LockEvent>,
    ) -> AcquireOutcome {
        if !self.observer_mode_enabled {
            events.push(
                LockEvent::new(LockEventKind::Denied, equipment_id.clone())
                    .with_session(session_id.clone())
                    .with_mode(LockMode::Observe)
                    .with_reason("observer mode disabled"),
            );
            return AcquireOutcome::Denied {
                reason: DenialReason::ObserverModeDisabled,
            };
        }

        let granted = AcquireOutcome::Granted {
            mode: LockMode::Observe,
            renewed: false,
            lease_timeout_ms: as_millis(timeout),
        };

        match state {
            EquipmentLockState::Unlocked => {
                let mut observers = HashMap::new();
                observers.insert(session_id.clone(), Lease::new(session_id.clone(), now, timeout));
                *state = EquipmentLockState::Observed { observers };
                events.push(acquired_event(equipment_id, session_id, LockMode::Observe));
                granted
            }
            EquipmentLockState::Observed { observers } => match observers.get_mut(session_id) {
                Some(lease) => {
                    lease.last_activity = now;
                    lease.timeout = timeout;
                    AcquireOutcome::Granted {
                        mode: LockMode::Observe,
                        renewed: true,
                        lease_timeout_ms: as_millis(timeout),
                    }
                }
                None => {
                    observers.insert(session_id.clone(), Lease::new(session_id.clone(), now, timeout));
                    events.push(acquired_event(equipment_id, session_id, LockMode::Observe));
                    granted
                }
            },
            // The exclusive holder may already observe; it keeps its stronger lease.
            EquipmentLockState::Exclusive { holder, .. } if holder.session_id == *session_id => {
                holder.last_activity = now;
                AcquireOutcome::Granted {
                    mode: LockMode::Exclusive,
                    renewed: true,
                    lease_timeout_ms: as_millis(holder.timeout),
                }
            }
            EquipmentLockState::Exclusive { holder, .. } => {
                events.push(
                    LockEvent::new(LockEventKind::Denied, equipment_id.clone())
                        .with_session(session_id.clone())
                        .with_mode(LockMode::Observe)
                        .with_reason(format!("exclusively held by {}", holder.session_id)),
                );
                AcquireOutcome::Denied {
                    reason: DenialReason::HeldExclusive {
                        holder: holder.session_id.clone(),
                    },
                }
            }
        }
    }

    fn acquire_exclusive(
        &self,
        equipment_id: &EquipmentId,
        state: &mut EquipmentLockState,
        session_id: &SessionId,
        timeout: Duration,
        now: Instant,
        events: &mut Vec<LockEvent>,
    ) -> AcquireOutcome {
        let granted = AcquireOutcome::Granted {
            mode: LockMode::Exclusive,
            renewed: false,
            lease_timeout_ms: as_millis(timeout),
        };

        match state {
            EquipmentLockState::Unlocked => {
                *state = EquipmentLockState::Exclusive {
                    holder: Lease::new(session_id.clone(), now, timeout),
                    waiters: VecDeque::new(),
                };
                events.push(acquired_event(equipment_id, session_id, LockMode::Exclusive));
                granted
            }
            EquipmentLockState::Observed { observers } => {
                if observers.len() == 1 && observers.contains_key(session_id) {
                    // Upgrade: sole observer -> exclusive holder
                    *state = EquipmentLockState::Exclusive {
                        holder: Lease::new(session_id.clone(), now, timeout),
                        waiters: VecDeque::new(),
                    };
                    events.push(
                        acquired_event(equipment_id, session_id, LockMode::Exclusive)
                            .with_reason("upgraded from observe"),
                    );
                    granted
                } else {
                    let mut others: Vec<SessionId> = observers
                        .keys()
                        .filter(|id| *id != session_id)
                        .cloned()
                        .collect();
                    others.sort();
                    events.push(
                        LockEvent::new(LockEventKind::Denied, equipment_id.clone())
                            .with_session(session_id.clone())
                            .with_mode(LockMode::Exclusive)
                            .with_reason(format!("observed by {} session(s)", others.len())),
                    );
                    AcquireOutcome::Denied {
                        reason: DenialReason::Observed { observers: others },
                    }
                }
            }
            EquipmentLockState::Exclusive { holder, waiters } => {
                if holder.session_id == *session_id {
                    // Same session: refresh the lease, queue untouched
                    holder.last_activity = now;
                    holder.timeout = timeout;
                    return AcquireOutcome::Granted {
                        mode: LockMode::Exclusive,
                        renewed: true,
                        lease_timeout_ms: as_millis(timeout),
                    };
                }

                if let Some(index) = waiters.iter().position(|w| w.session_id == *session_id) {
                    return AcquireOutcome::Queued {
                        position: index + 1,
                        holder: holder.session_id.clone(),
                    };
                }

                if !self.queue_enabled {
                    events.push(
                        LockEvent::new(LockEventKind::Denied, equipment_id.clone())
                            .with_session(session_id.clone())
                            .with_mode(LockMode::Exclusive)
                            .with_reason("lock queue disabled"),
                    );
                    return AcquireOutcome::Denied {
                        reason: DenialReason::QueueDisabled {
                            holder: holder.session_id.clone(),
                        },
                    };
                }

                waiters.push_back(QueuedRequest {
                    session_id: session_id.clone(),
                    requested_at: now,
                    requested_timeout: timeout,
                });
                events.push(
                    LockEvent::new(LockEventKind::Queued, equipment_id.clone())
                        .with_session(session_id.clone())
                        .with_mode(LockMode::Exclusive)
                        .with_reason(format!("waiting behind {}", holder.session_id)),
                );
                AcquireOutcome::Queued {
                    position: waiters.len(),
                    holder: holder.session_id.clone(),
                }
            }
        }
    }

    /// Releases the caller's lease and promotes the next waiter.
    pub fn release(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> ReleaseOutcome {
        self.release_at(equipment_id, session_id, Instant::now())
    }

    pub fn release_at(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        now: Instant,
    ) -> ReleaseOutcome {
        let mut entry = match self.records.get_mut(equipment_id) {
            Some(e) => e,
            None => {
                tracing::warn!(
                    equipment_id = %equipment_id,
                    session_id = %session_id,
                    "release of never-locked equipment ignored"
                );
                return ReleaseOutcome::NotHeld;
            }
        };
        let EquipmentRecord { state, history } = &mut *entry;

        let mut events = Vec::new();
        let outcome = match release_lease(
            equipment_id,
            state,
            session_id,
            LockEventKind::Released,
            "released by holder",
            now,
            &mut events,
        ) {
            Some(promoted) => ReleaseOutcome::Released { promoted },
            None => {
                tracing::warn!(
                    equipment_id = %equipment_id,
                    session_id = %session_id,
                    "release requested by non-holder"
                );
                events.push(
                    LockEvent::new(LockEventKind::Denied, equipment_id.clone())
                        .with_session(session_id.clone())
                        .with_reason("release requested by non-holder"),
                );
                ReleaseOutcome::NotHeld
            }
        };
        self.emit_all(history, events);

        if let ReleaseOutcome::Released { promoted } = &outcome {
            tracing::info!(
                equipment_id = %equipment_id,
                session_id = %session_id,
                promoted = ?promoted,
                "lock released"
            );
        }
        outcome
    }

    /// Refreshes the caller's lease. Returns `false` if the lease was lost.
    pub fn renew(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        self.renew_at(equipment_id, session_id, Instant::now())
    }

    pub fn renew_at(&self, equipment_id: &EquipmentId, session_id: &SessionId, now: Instant) -> bool {
        let Some(mut entry) = self.records.get_mut(equipment_id) else {
            return false;
        };
        match entry.state.lease_mut(session_id) {
            Some(lease) => {
                lease.last_activity = now;
                tracing::debug!(equipment_id = %equipment_id, session_id = %session_id, "lease renewed");
                true
            }
            None => false,
        }
    }

    /// Renews every lease held by the session. Returns the renewed ids.
    pub fn renew_session_at(&self, session_id: &SessionId, now: Instant) -> Vec<EquipmentId> {
        let mut renewed = Vec::new();
        for mut entry in self.records.iter_mut() {
            let equipment_id = entry.key().clone();
            if let Some(lease) = entry.value_mut().state.lease_mut(session_id) {
                lease.last_activity = now;
                renewed.push(equipment_id);
            }
        }
        renewed.sort();
        renewed
    }

    /// Checks access for one command and renews the caller's lease under the
    /// same entry guard.
    ///
    /// `Exclusive` requires the caller to be the exclusive holder. `Observe`
    /// requires that no other session holds exclusive; an observer lease, if
    /// the caller has one, is renewed. A lease released by a concurrent sweep
    /// is never renewed back to life.
    pub fn authorize_at(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        required: LockMode,
        now: Instant,
    ) -> bool {
        let Some(mut entry) = self.records.get_mut(equipment_id) else {
            return required == LockMode::Observe;
        };
        let state = &mut entry.state;

        let permitted = match (required, &*state) {
            (LockMode::Exclusive, EquipmentLockState::Exclusive { holder, .. }) => {
                holder.session_id == *session_id
            }
            (LockMode::Exclusive, _) => false,
            (LockMode::Observe, EquipmentLockState::Exclusive { holder, .. }) => {
                holder.session_id == *session_id
            }
            (LockMode::Observe, _) => true,
        };
        if permitted {
            if let Some(lease) = state.lease_mut(session_id) {
                lease.last_activity = now;
            }
        }
        permitted
    }

    /// Withdraws a queued exclusive request without disturbing the others.
    pub fn cancel(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        let Some(mut entry) = self.records.get_mut(equipment_id) else {
            return false;
        };
        let EquipmentRecord { state, history } = &mut *entry;

        let withdrawn = withdraw(state, session_id);
        if withdrawn {
            self.emit(
                history,
                LockEvent::new(LockEventKind::Cancelled, equipment_id.clone())
                    .with_session(session_id.clone())
                    .with_mode(LockMode::Exclusive)
                    .with_reason("withdrawn by requester"),
            );
            tracing::debug!(equipment_id = %equipment_id, session_id = %session_id, "queued request cancelled");
        }
        withdrawn
    }

    /// Administrative override: clears every holder and the wait queue.
    ///
    /// Nobody is re-granted; queued sessions must request again. Returns the
    /// sessions whose leases were revoked.
    pub fn force_release(&self, equipment_id: &EquipmentId, actor: &str) -> Vec<SessionId> {
        let Some(mut entry) = self.records.get_mut(equipment_id) else {
            return Vec::new();
        };
        let EquipmentRecord { state, history } = &mut *entry;

        let mut events = Vec::new();
        let mut evicted = Vec::new();
        match std::mem::replace(state, EquipmentLockState::Unlocked) {
            EquipmentLockState::Unlocked => {}
            EquipmentLockState::Observed { observers } => {
                let mut ids: Vec<SessionId> = observers.into_keys().collect();
                ids.sort();
                for id in ids {
                    events.push(
                        LockEvent::new(LockEventKind::ForceReleased, equipment_id.clone())
                            .with_session(id.clone())
                            .with_mode(LockMode::Observe)
                            .with_reason(format!("forced by {actor}")),
                    );
                    evicted.push(id);
                }
            }
            EquipmentLockState::Exclusive { holder, waiters } => {
                events.push(
                    LockEvent::new(LockEventKind::ForceReleased, equipment_id.clone())
                        .with_session(holder.session_id.clone())
                        .with_mode(LockMode::Exclusive)
                        .with_reason(format!(
                            "forced by {actor}; {} queued request(s) dropped",
                            waiters.len()
                        )),
                );
                for waiter in waiters {
                    events.push(
                        LockEvent::new(LockEventKind::Cancelled, equipment_id.clone())
                            .with_session(waiter.session_id)
                            .with_mode(LockMode::Exclusive)
                            .with_reason("queue cleared by force release"),
                    );
                }
                evicted.push(holder.session_id);
            }
        }
        self.emit_all(history, events);

        tracing::info!(
            equipment_id = %equipment_id,
            actor,
            evicted = evicted.len(),
            "lock force-released"
        );
        evicted
    }

    /// Opt-in eviction of a single observer, leaving other observers intact.
    pub fn force_release_observer(
        &self,
        equipment_id: &EquipmentId,
        session_id: &SessionId,
        actor: &str,
    ) -> bool {
        let Some(mut entry) = self.records.get_mut(equipment_id) else {
            return false;
        };
        let EquipmentRecord { state, history } = &mut *entry;

        let evicted = match state {
            EquipmentLockState::Observed { observers } => observers.remove(session_id).is_some(),
            _ => false,
        };
        if !evicted {
            return false;
        }
        if matches!(&*state, EquipmentLockState::Observed { observers } if observers.is_empty()) {
            *state = EquipmentLockState::Unlocked;
        }
        self.emit(
            history,
            LockEvent::new(LockEventKind::ForceReleased, equipment_id.clone())
                .with_session(session_id.clone())
                .with_mode(LockMode::Observe)
                .with_reason(format!("observer evicted by {actor}")),
        );
        tracing::info!(equipment_id = %equipment_id, session_id = %session_id, actor, "observer force-released");
        true
    }

    /// Releases every lease held by the session and purges it from all queues.
    ///
    /// Returns the equipment ids whose leases were released.
    pub fn release_session(
        &self,
        session_id: &SessionId,
        kind: LockEventKind,
        reason: &str,
    ) -> Vec<EquipmentId> {
        self.release_session_at(session_id, kind, reason, Instant::now())
    }

    pub fn release_session_at(
        &self,
        session_id: &SessionId,
        kind: LockEventKind,
        reason: &str,
        now: Instant,
    ) -> Vec<EquipmentId> {
        // Collect first: never hold one entry guard while taking another.
        let candidates: Vec<EquipmentId> = self
            .records
            .iter()
            .filter(|entry| entry.value().state.involves(session_id))
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = Vec::new();
        for equipment_id in candidates {
            let Some(mut entry) = self.records.get_mut(&equipment_id) else {
                continue;
            };
            let EquipmentRecord { state, history } = &mut *entry;

            let mut events = Vec::new();
            if withdraw(state, session_id) {
                events.push(
                    LockEvent::new(LockEventKind::Cancelled, equipment_id.clone())
                        .with_session(session_id.clone())
                        .with_mode(LockMode::Exclusive)
                        .with_reason(reason),
                );
            }
            if release_lease(&equipment_id, state, session_id, kind, reason, now, &mut events).is_some() {
                released.push(equipment_id.clone());
            }
            self.emit_all(history, events);
        }

        released.sort();
        if !released.is_empty() {
            tracing::info!(session_id = %session_id, released = ?released, "session leases released");
        }
        released
    }

    /// Releases every lease idle longer than its timeout, promoting waiters.
    pub fn expire_stale(&self) -> Vec<ExpiredLease> {
        self.expire_stale_at(Instant::now())
    }

    pub fn expire_stale_at(&self, now: Instant) -> Vec<ExpiredLease> {
        let mut candidates = Vec::new();
        for entry in self.records.iter() {
            for session_id in entry.value().state.expired_sessions(now) {
                candidates.push((entry.key().clone(), session_id));
            }
        }

        let mut expired = Vec::new();
        for (equipment_id, session_id) in candidates {
            let Some(mut entry) = self.records.get_mut(&equipment_id) else {
                continue;
            };
            let EquipmentRecord { state, history } = &mut *entry;

            // Re-check under the entry guard; a concurrent renew wins.
            if !state.lease(&session_id).is_some_and(|lease| lease.is_expired(now)) {
                continue;
            }

            let mut events = Vec::new();
            if let Some(promoted) = release_lease(
                &equipment_id,
                state,
                &session_id,
                LockEventKind::Expired,
                "lease expired",
                now,
                &mut events,
            ) {
                tracing::info!(
                    equipment_id = %equipment_id,
                    session_id = %session_id,
                    promoted = ?promoted,
                    "lease expired"
                );
                expired.push(ExpiredLease {
                    equipment_id: equipment_id.clone(),
                    session_id,
                    promoted,
                });
            }
            self.emit_all(history, events);
        }
        expired
    }

    /// Whether the session is the current exclusive holder.
    pub fn holds_exclusive(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        self.records.get(equipment_id).is_some_and(|entry| {
            matches!(
                &entry.state,
                EquipmentLockState::Exclusive { holder, .. } if holder.session_id == *session_id
            )
        })
    }

    /// Whether observation is permitted: no *other* session holds exclusive.
    pub fn observe_permitted(&self, equipment_id: &EquipmentId, session_id: &SessionId) -> bool {
        match self.exclusive_holder(equipment_id) {
            Some(holder) => holder == *session_id,
            None => true,
        }
    }

    pub fn exclusive_holder(&self, equipment_id: &EquipmentId) -> Option<SessionId> {
        let entry = self.records.get(equipment_id)?;
        match &entry.state {
            EquipmentLockState::Exclusive { holder, .. } => Some(holder.session_id.clone()),
            _ => None,
        }
    }

    /// Status of one equipment id. Unknown ids report mode `none`.
    pub fn status(&self, equipment_id: &EquipmentId) -> LockStatus {
        self.status_at(equipment_id, Instant::now())
    }

    pub fn status_at(&self, equipment_id: &EquipmentId, now: Instant) -> LockStatus {
        match self.records.get(equipment_id) {
            Some(entry) => build_status(equipment_id, &entry.state, now, Utc::now()),
            None => build_status(equipment_id, &EquipmentLockState::Unlocked, now, Utc::now()),
        }
    }

    /// Status of every equipment id that is not idle, sorted by id.
    pub fn status_all(&self) -> Vec<LockStatus> {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut statuses: Vec<LockStatus> = self
            .records
            .iter()
            .filter(|entry| !matches!(entry.value().state, EquipmentLockState::Unlocked))
            .map(|entry| build_status(entry.key(), &entry.value().state, now, now_utc))
            .collect();
        statuses.sort_by(|a, b| a.equipment_id.cmp(&b.equipment_id));
        statuses
    }

    pub fn list_queue(&self, equipment_id: &EquipmentId) -> Vec<QueueEntry> {
        self.status(equipment_id).queue
    }

    /// Retained events for the equipment id, oldest first.
    pub fn list_events(&self, equipment_id: &EquipmentId) -> Vec<LockEvent> {
        self.records
            .get(equipment_id)
            .map(|entry| entry.history.snapshot())
            .unwrap_or_default()
    }
}

/// Drops the session's lease and promotes the head waiter.
///
/// Returns `None` if the session held nothing, otherwise the promoted waiter.
fn release_lease(
    equipment_id: &EquipmentId,
    state: &mut EquipmentLockState,
    session_id: &SessionId,
    kind: LockEventKind,
    reason: &str,
    now: Instant,
    events: &mut Vec<LockEvent>,
) -> Option<Option<SessionId>> {
    let (next, result) = match std::mem::replace(state, EquipmentLockState::Unlocked) {
        EquipmentLockState::Observed { mut observers } => {
            if observers.remove(session_id).is_some() {
                events.push(
                    LockEvent::new(kind, equipment_id.clone())
                        .with_session(session_id.clone())
                        .with_mode(LockMode::Observe)
                        .with_reason(reason),
                );
                let next = if observers.is_empty() {
                    EquipmentLockState::Unlocked
                } else {
                    EquipmentLockState::Observed { observers }
                };
                (next, Some(None))
            } else {
                (EquipmentLockState::Observed { observers }, None)
            }
        }
        EquipmentLockState::Exclusive { holder, mut waiters } if holder.session_id == *session_id => {
            events.push(
                LockEvent::new(kind, equipment_id.clone())
                    .with_session(session_id.clone())
                    .with_mode(LockMode::Exclusive)
                    .with_reason(reason),
            );
            match waiters.pop_front() {
                Some(waiter) => {
                    events.push(
                        acquired_event(equipment_id, &waiter.session_id, LockMode::Exclusive)
                            .with_reason("promoted from queue"),
                    );
                    let promoted = waiter.session_id.clone();
                    let holder = Lease::new(waiter.session_id, now, waiter.requested_timeout);
                    (EquipmentLockState::Exclusive { holder, waiters }, Some(Some(promoted)))
                }
                None => (EquipmentLockState::Unlocked, Some(None)),
            }
        }
        other => (other, None),
    };
    *state = next;
    result
}

/// Removes the session from the wait queue, keeping the order of the rest.
fn withdraw(state: &mut EquipmentLockState, session_id: &SessionId) -> bool {
    match state {
        EquipmentLockState::Exclusive { waiters, .. } => {
            let before = waiters.len();
            waiters.retain(|w| w.session_id != *session_id);
            waiters.len() != before
        }
        _ => false,
    }
}

fn acquired_event(equipment_id: &EquipmentId, session_id: &SessionId, mode: LockMode) -> LockEvent {
    LockEvent::new(LockEventKind::Acquired, equipment_id.clone())
        .with_session(session_id.clone())
        .with_mode(mode)
}

fn build_status(
    equipment_id: &EquipmentId,
    state: &EquipmentLockState,
    now: Instant,
    now_utc: DateTime<Utc>,
) -> LockStatus {
    let holder_status = |lease: &Lease| HolderStatus {
        session_id: lease.session_id.clone(),
        acquired_at: wall_clock(lease.acquired_at, now, now_utc),
        last_activity: wall_clock(lease.last_activity, now, now_utc),
        lease_timeout_ms: as_millis(lease.timeout),
        lease_remaining_ms: as_millis(lease.remaining(now)),
    };

    match state {
        EquipmentLockState::Unlocked => LockStatus {
            equipment_id: equipment_id.clone(),
            mode: EquipmentMode::None,
            holders: Vec::new(),
            lease_remaining_ms: None,
            queue_depth: 0,
            queue: Vec::new(),
        },
        EquipmentLockState::Observed { observers } => {
            let mut holders: Vec<HolderStatus> = observers.values().map(holder_status).collect();
            holders.sort_by(|a, b| a.session_id.cmp(&b.session_id));
            LockStatus {
                equipment_id: equipment_id.clone(),
                mode: EquipmentMode::Observe,
                lease_remaining_ms: holders.iter().map(|h| h.lease_remaining_ms).max(),
                holders,
                queue_depth: 0,
                queue: Vec::new(),
            }
        }
        EquipmentLockState::Exclusive { holder, waiters } => {
            let queue: Vec<QueueEntry> = waiters
                .iter()
                .enumerate()
                .map(|(i, w)| QueueEntry {
                    position: i + 1,
                    session_id: w.session_id.clone(),
                    requested_at: wall_clock(w.requested_at, now, now_utc),
                    requested_timeout_ms: as_millis(w.requested_timeout),
                })
                .collect();
            LockStatus {
                equipment_id: equipment_id.clone(),
                mode: EquipmentMode::Exclusive,
                holders: vec![holder_status(holder)],
                lease_remaining_ms: Some(as_millis(holder.remaining(now))),
                queue_depth: queue.len(),
                queue,
            }
        }
    }
}
