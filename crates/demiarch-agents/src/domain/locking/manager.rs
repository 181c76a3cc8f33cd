//! Lock manager implementation
//!
//! The lock table is a sharded map from [`ResourceKey`] to a per-key slot.
//! Each slot has its own mutex, so unrelated keys never contend. A slot lock
//! is never held while touching the map itself.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::LockEvent;
use super::handle::LockHandle;
use super::types::{LockConfig, LockError, LockMode, LockRecord, LockResult, LockState, ResourceKey};
use crate::domain::execution::ExecutionId;

/// Tells the lock manager whether a holder is still alive
pub trait HolderLiveness: Send + Sync {
    /// `true` while the holder's execution is `Running`
    fn is_running(&self, holder: ExecutionId) -> bool;
}

/// Receives every lock event; must not block
pub trait LockAuditSink: Send + Sync {
    fn record(&self, event: &LockEvent);
}

/// Current state of one key, for introspection
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub key: ResourceKey,
    pub holders: Vec<LockRecord>,
    pub waiting: Vec<LockRecord>,
}

struct HeldLock {
    record: LockRecord,
    deadline: Instant,
}

struct Waiter {
    record: LockRecord,
    lease: Duration,
    tx: oneshot::Sender<LockRecord>,
}

#[derive(Default)]
struct KeyState {
    holders: Vec<HeldLock>,
    queue: VecDeque<Waiter>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.holders.is_empty(),
            LockMode::Shared => self.holders.iter().all(|h| h.record.mode == LockMode::Shared),
        }
    }

    fn involves(&self, holder: ExecutionId) -> bool {
        self.holders.iter().any(|h| h.record.requester == holder)
            || self.queue.iter().any(|w| w.record.requester == holder)
    }

    fn holder_ids(&self) -> Vec<ExecutionId> {
        self.holders.iter().map(|h| h.record.requester).collect()
    }

    fn holder_names(&self) -> String {
        if self.holders.is_empty() {
            return "queued requests".to_string();
        }
        self.holders
            .iter()
            .map(|h| h.record.requester.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

type Slot = Arc<Mutex<KeyState>>;

pub(crate) struct Inner {
    table: DashMap<ResourceKey, Slot>,
    config: LockConfig,
    host: String,
    liveness: RwLock<Option<Arc<dyn HolderLiveness>>>,
    audit: RwLock<Option<Arc<dyn LockAuditSink>>>,
    events: broadcast::Sender<LockEvent>,
}

impl Inner {
    fn slot(&self, key: &ResourceKey) -> Slot {
        self.table.entry(key.clone()).or_default().value().clone()
    }

    fn existing_slot(&self, key: &ResourceKey) -> Option<Slot> {
        self.table.get(key).map(|entry| entry.value().clone())
    }

    /// Drop the slot of a key nobody holds, waits on, or is about to use
    fn cleanup(&self, key: &ResourceKey) {
        self.table
            .remove_if(key, |_, slot| Arc::strong_count(slot) == 1 && slot.lock().is_idle());
    }

    fn emit(&self, event: LockEvent) {
        if let Some(sink) = self.audit.read().as_ref() {
            sink.record(&event);
        }
        let _ = self.events.send(event);
    }

    /// Grant queued requests in arrival order until one is incompatible
    fn grant_waiters(&self, state: &mut KeyState) {
        while let Some(front) = state.queue.front() {
            if front.tx.is_closed() {
                state.queue.pop_front();
                continue;
            }
            if !state.admits(front.record.mode) {
                break;
            }
            let Some(mut waiter) = state.queue.pop_front() else {
                break;
            };
            waiter.record.grant(waiter.lease);
            let granted = waiter.record.clone();
            if waiter.tx.send(waiter.record).is_err() {
                // Receiver vanished between the check and the send
                continue;
            }
            let waited_ms = waited_ms(&granted);
            info!(
                lock_key = %granted.key,
                holder = %granted.requester,
                mode = %granted.mode,
                waited_ms,
                "Lock granted to queued request"
            );
            self.emit(LockEvent::acquired(&granted, waited_ms));
            state.holders.push(HeldLock {
                record: granted,
                deadline: lease_deadline(waiter.lease),
            });
        }
    }

    /// Forcibly release expired locks whose holders are no longer running
    fn reclaim_expired(&self, state: &mut KeyState) -> Vec<LockRecord> {
        let now = Instant::now();
        let liveness = self.liveness.read().clone();
        let mut reclaimed = Vec::new();

        let mut i = 0;
        while i < state.holders.len() {
            let held = &state.holders[i];
            let alive = liveness
                .as_ref()
                .is_some_and(|l| l.is_running(held.record.requester));
            if held.deadline > now || alive {
                i += 1;
                continue;
            }

            let mut expired = state.holders.remove(i);
            let overdue_ms = now.duration_since(expired.deadline).as_millis() as u64;
            expired.record.finish(LockState::Reclaimed);
            let err = LockError::ForcedReclaim {
                resource: expired.record.key.to_string(),
                holder: expired.record.requester,
            };
            warn!(
                lock_key = %expired.record.key,
                prior_holder = %expired.record.requester,
                overdue_ms,
                code = err.code(),
                "{}",
                err
            );
            self.emit(LockEvent::forced_reclaim(&expired.record, overdue_ms));
            reclaimed.push(expired.record);
        }

        if !reclaimed.is_empty() {
            self.grant_waiters(state);
        }
        reclaimed
    }
}

fn lease_deadline(lease: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(lease)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

fn waited_ms(record: &LockRecord) -> u64 {
    let granted = record.acquired_at.unwrap_or_else(chrono::Utc::now);
    (granted - record.requested_at).num_milliseconds().max(0) as u64
}

/// Removes a queued request if the acquiring future is dropped or gives up
struct WaitGuard {
    inner: Arc<Inner>,
    slot: Option<Slot>,
    key: ResourceKey,
    lock_id: Uuid,
}

enum Withdrawal {
    /// Still queued; removed
    Dequeued(LockRecord),
    /// Granted before the withdrawal took the slot lock
    Granted(LockRecord),
    Gone,
}

impl WaitGuard {
    fn withdraw(&mut self, release_grant: bool) -> Withdrawal {
        let Some(slot) = self.slot.take() else {
            return Withdrawal::Gone;
        };
        let outcome = {
            let mut state = slot.lock();
            if let Some(pos) = state.queue.iter().position(|w| w.record.id == self.lock_id) {
                let waiter = state.queue.remove(pos);
                self.inner.grant_waiters(&mut state);
                waiter.map_or(Withdrawal::Gone, |w| Withdrawal::Dequeued(w.record))
            } else if let Some(pos) = state.holders.iter().position(|h| h.record.id == self.lock_id) {
                if release_grant {
                    let mut held = state.holders.remove(pos);
                    held.record.finish(LockState::Released);
                    debug!(lock_key = %self.key, "Released lock granted to an abandoned request");
                    self.inner.emit(LockEvent::released(&held.record));
                    self.inner.grant_waiters(&mut state);
                    Withdrawal::Granted(held.record)
                } else {
                    Withdrawal::Granted(state.holders[pos].record.clone())
                }
            } else {
                Withdrawal::Gone
            }
        };
        drop(slot);
        self.inner.cleanup(&self.key);
        outcome
    }

    fn disarm(&mut self) -> Option<Slot> {
        self.slot.take()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.withdraw(true);
        }
    }
}

/// Grants and revokes exclusive or shared access to named resources
///
/// Cheap to clone; all clones share one lock table.
#[derive(Clone)]
pub struct ResourceLockManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResourceLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLockManager")
            .field("keys", &self.inner.table.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl ResourceLockManager {
    /// Create a new lock manager with the given configuration
    pub fn new(config: LockConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        Self {
            inner: Arc::new(Inner {
                table: DashMap::new(),
                config,
                host,
                liveness: RwLock::new(None),
                audit: RwLock::new(None),
                events,
            }),
        }
    }

    /// Use `liveness` to decide whether an expired holder may be reclaimed
    pub fn with_liveness(self, liveness: Arc<dyn HolderLiveness>) -> Self {
        *self.inner.liveness.write() = Some(liveness);
        self
    }

    /// Forward every lock event to `sink`
    pub fn with_audit_sink(self, sink: Arc<dyn LockAuditSink>) -> Self {
        *self.inner.audit.write() = Some(sink);
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Subscribe to lock events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire a lock on `key` for `holder`
    ///
    /// Waits in FIFO order behind incompatible holders and earlier requests
    /// until the lock is granted or `timeout` (default 300s) elapses. The
    /// same duration is the lease of the granted lock. Dropping the returned
    /// future withdraws the request.
    pub async fn acquire(
        &self,
        key: ResourceKey,
        holder: ExecutionId,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> LockResult<LockHandle> {
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let started = Instant::now();
        let mut record = LockRecord::requested(key.clone(), mode, holder, &self.inner.host);

        let slot = self.inner.slot(&key);
        let rx = {
            let mut state = slot.lock();
            if state.involves(holder) {
                return Err(LockError::AlreadyHeld {
                    resource: key.to_string(),
                    holder,
                });
            }

            self.inner.reclaim_expired(&mut state);

            if state.queue.is_empty() && state.admits(mode) {
                record.grant(timeout);
                state.holders.push(HeldLock {
                    record: record.clone(),
                    deadline: lease_deadline(timeout),
                });
                info!(lock_key = %key, holder = %holder, mode = %mode, "Lock acquired");
                self.inner.emit(LockEvent::acquired(&record, 0));
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let holders = state.holder_ids();
                state.queue.push_back(Waiter {
                    record: record.clone(),
                    lease: timeout,
                    tx,
                });
                debug!(
                    lock_key = %key,
                    holder = %holder,
                    queue_len = state.queue.len(),
                    "Lock contended, waiting"
                );
                self.inner
                    .emit(LockEvent::contended(&record, &holders, state.queue.len()));
                Some(rx)
            }
        };

        let Some(mut rx) = rx else {
            return Ok(LockHandle::new(self.clone(), record));
        };

        let mut guard = WaitGuard {
            inner: self.inner.clone(),
            slot: Some(slot),
            key: key.clone(),
            lock_id: record.id,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(granted)) => {
                guard.disarm();
                info!(
                    lock_key = %key,
                    holder = %holder,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                Ok(LockHandle::new(self.clone(), granted))
            }
            Ok(Err(_)) => {
                guard.withdraw(true);
                Err(LockError::InvalidState(format!(
                    "lock request for '{}' was dropped without a grant",
                    key
                )))
            }
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                let current = guard
                    .slot
                    .as_ref()
                    .map(|slot| slot.lock().holder_names())
                    .unwrap_or_default();
                match guard.withdraw(false) {
                    Withdrawal::Granted(granted) => {
                        // The grant raced the timer; keep it
                        Ok(LockHandle::new(self.clone(), granted))
                    }
                    Withdrawal::Dequeued(mut expired) => {
                        expired.finish(LockState::TimedOut);
                        warn!(lock_key = %key, holder = %holder, waited_ms, "Lock acquisition timed out");
                        self.inner.emit(LockEvent::timed_out(&expired, waited_ms));
                        Err(LockError::Timeout {
                            resource: key.to_string(),
                            holder: current,
                            waited_ms,
                        })
                    }
                    Withdrawal::Gone => Err(LockError::Timeout {
                        resource: key.to_string(),
                        holder: current,
                        waited_ms,
                    }),
                }
            }
        }
    }

    /// Try to acquire a lock without waiting
    pub fn try_acquire(
        &self,
        key: ResourceKey,
        holder: ExecutionId,
        mode: LockMode,
    ) -> LockResult<Option<LockHandle>> {
        let lease = self.inner.config.default_timeout;
        let slot = self.inner.slot(&key);
        let granted = {
            let mut state = slot.lock();
            if state.involves(holder) {
                return Err(LockError::AlreadyHeld {
                    resource: key.to_string(),
                    holder,
                });
            }
            self.inner.reclaim_expired(&mut state);
            if state.queue.is_empty() && state.admits(mode) {
                let mut record = LockRecord::requested(key.clone(), mode, holder, &self.inner.host);
                record.grant(lease);
                state.holders.push(HeldLock {
                    record: record.clone(),
                    deadline: lease_deadline(lease),
                });
                self.inner.emit(LockEvent::acquired(&record, 0));
                Some(record)
            } else {
                None
            }
        };
        drop(slot);

        match granted {
            Some(record) => Ok(Some(LockHandle::new(self.clone(), record))),
            None => {
                self.inner.cleanup(&key);
                Ok(None)
            }
        }
    }

    /// Release a lock; idempotent
    pub fn release(&self, handle: &LockHandle) -> bool {
        handle.release()
    }

    pub(crate) fn release_lock(&self, key: &ResourceKey, lock_id: Uuid) -> bool {
        let Some(slot) = self.inner.existing_slot(key) else {
            return false;
        };
        let released = {
            let mut state = slot.lock();
            match state.holders.iter().position(|h| h.record.id == lock_id) {
                Some(pos) => {
                    let mut held = state.holders.remove(pos);
                    held.record.finish(LockState::Released);
                    info!(
                        lock_key = %key,
                        holder = %held.record.requester,
                        held_ms = held.record.held_ms().unwrap_or_default(),
                        "Lock released"
                    );
                    self.inner.emit(LockEvent::released(&held.record));
                    self.inner.grant_waiters(&mut state);
                    true
                }
                None => {
                    debug!(lock_key = %key, %lock_id, "Release of a lock that is no longer held");
                    false
                }
            }
        };
        drop(slot);
        self.inner.cleanup(key);
        released
    }

    /// Whether the grant `lock_id` on `key` is still in the table
    pub(crate) fn is_granted(&self, key: &ResourceKey, lock_id: Uuid) -> bool {
        self.inner
            .existing_slot(key)
            .is_some_and(|slot| slot.lock().holders.iter().any(|h| h.record.id == lock_id))
    }

    /// Reclaim every expired lock whose holder is not running
    pub fn sweep(&self) -> Vec<LockRecord> {
        let slots: Vec<(ResourceKey, Slot)> = self
            .inner
            .table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reclaimed = Vec::new();
        for (key, slot) in slots {
            reclaimed.extend(self.inner.reclaim_expired(&mut slot.lock()));
            drop(slot);
            self.inner.cleanup(&key);
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Lock sweep reclaimed expired locks");
        }
        reclaimed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` fires
    ///
    /// The task holds only a weak reference and stops once every manager
    /// clone has been dropped.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        ResourceLockManager { inner }.sweep();
                    }
                }
            }
            debug!("Lock sweeper stopped");
        })
    }

    /// Current holders and queued requests of every active key
    pub fn snapshot(&self) -> Vec<KeySnapshot> {
        let slots: Vec<(ResourceKey, Slot)> = self
            .inner
            .table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut snapshot: Vec<KeySnapshot> = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let state = slot.lock();
                (!state.is_idle()).then(|| KeySnapshot {
                    key,
                    holders: state.holders.iter().map(|h| h.record.clone()).collect(),
                    waiting: state.queue.iter().map(|w| w.record.clone()).collect(),
                })
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    /// Locks currently granted to `holder`
    pub fn held_by(&self, holder: ExecutionId) -> Vec<LockRecord> {
        self.snapshot()
            .into_iter()
            .flat_map(|s| s.holders)
            .filter(|r| r.requester == holder)
            .collect()
    }

    /// Whether `key` has at least one holder
    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.inner
            .existing_slot(key)
            .is_some_and(|slot| !slot.lock().holders.is_empty())
    }

    /// Number of keys with holders or waiters
    pub fn active_keys(&self) -> usize {
        self.inner.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::locking::LockEventType;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> ResourceKey {
        ResourceKey::file("proj", name)
    }

    struct FixedLiveness(HashSet<ExecutionId>);

    impl HolderLiveness for FixedLiveness {
        fn is_running(&self, holder: ExecutionId) -> bool {
            self.0.contains(&holder)
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let manager = ResourceLockManager::default();
        let holder = ExecutionId::new();

        let handle = manager
            .acquire(key("a.rs"), holder, LockMode::Exclusive, None)
            .await
            .unwrap();
        assert!(manager.is_locked(&key("a.rs")));
        assert_eq!(manager.held_by(holder).len(), 1);

        assert!(handle.verify().is_ok());
        assert!(handle.release());
        assert!(handle.verify().is_ok());
        assert!(!manager.is_locked(&key("a.rs")));
        assert_eq!(manager.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_double_release_is_noop() {
        let manager = ResourceLockManager::default();
        let first = ExecutionId::new();
        let second = ExecutionId::new();

        let handle = manager
            .acquire(key("a.rs"), first, LockMode::Exclusive, None)
            .await
            .unwrap();
        assert!(manager.release(&handle));

        let other = manager
            .acquire(key("a.rs"), second, LockMode::Exclusive, None)
            .await
            .unwrap();

        // Second release must not free the lock now held by `other`
        assert!(!manager.release(&handle));
        assert!(manager.is_locked(&key("a.rs")));
        assert_eq!(manager.held_by(second).len(), 1);
        drop(handle);
        assert!(manager.is_locked(&key("a.rs")));
        drop(other);
        assert!(!manager.is_locked(&key("a.rs")));
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let manager = ResourceLockManager::default();
        {
            let _handle = manager
                .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
                .await
                .unwrap();
            assert!(manager.is_locked(&key("a.rs")));
        }
        assert!(!manager.is_locked(&key("a.rs")));
    }

    #[tokio::test]
    async fn test_already_held_by_same_holder() {
        let manager = ResourceLockManager::default();
        let holder = ExecutionId::new();
        let _handle = manager
            .acquire(key("a.rs"), holder, LockMode::Shared, None)
            .await
            .unwrap();

        let err = manager
            .acquire(key("a.rs"), holder, LockMode::Shared, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyHeld { .. }));
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let manager = ResourceLockManager::default();
        let a = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Shared, None)
            .await
            .unwrap();
        let b = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Shared, None)
            .await
            .unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].holders.len(), 2);

        let blocked = manager
            .try_acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive)
            .unwrap();
        assert!(blocked.is_none());
        drop((a, b));
    }

    #[tokio::test]
    async fn test_second_exclusive_waits_for_release() {
        let manager = ResourceLockManager::default();
        let first = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
            .await
            .unwrap();

        let m = manager.clone();
        let second_holder = ExecutionId::new();
        let waiter = tokio::spawn(async move {
            m.acquire(key("a.rs"), second_holder, LockMode::Exclusive, None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(manager.snapshot()[0].waiting.len(), 1);

        first.release();
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.holder(), second_holder);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_never_released() {
        let manager = ResourceLockManager::default();
        let holder = ExecutionId::new();
        let _first = manager
            .acquire(key("a.rs"), holder, LockMode::Exclusive, Some(Duration::from_secs(600)))
            .await
            .unwrap();

        let err = manager
            .acquire(
                key("a.rs"),
                ExecutionId::new(),
                LockMode::Exclusive,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap_err();

        match err {
            LockError::Timeout { holder: h, .. } => assert_eq!(h, holder.to_string()),
            other => panic!("unexpected error: {other:?}"),
        }
        // The timed-out request left no queue entry behind
        assert!(manager.snapshot()[0].waiting.is_empty());
    }

    #[tokio::test]
    async fn test_fifo_grant_order() {
        let manager = ResourceLockManager::default();
        let first = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..4 {
            let m = manager.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let handle = m
                    .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
                    .await
                    .unwrap();
                order.lock().push(i);
                drop(handle);
            }));
            // Let each waiter enqueue before the next arrives
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        first.release();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_shared_request_does_not_barge_past_queued_exclusive() {
        let manager = ResourceLockManager::default();
        let reader = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Shared, None)
            .await
            .unwrap();

        let m = manager.clone();
        let writer = tokio::spawn(async move {
            m.acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let late_reader = manager
            .try_acquire(key("a.rs"), ExecutionId::new(), LockMode::Shared)
            .unwrap();
        assert!(late_reader.is_none());

        reader.release();
        let writer = writer.await.unwrap().unwrap();
        assert_eq!(writer.mode(), LockMode::Exclusive);
    }

    #[tokio::test]
    async fn test_dropped_acquire_withdraws_request() {
        let manager = ResourceLockManager::default();
        let first = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
            .await
            .unwrap();

        let m = manager.clone();
        let abandoned = tokio::spawn(async move {
            m.acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        let _ = abandoned.await;

        assert!(manager.snapshot()[0].waiting.is_empty());
        first.release();
        assert!(!manager.is_locked(&key("a.rs")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_dead_holder() {
        let dead = ExecutionId::new();
        let manager = ResourceLockManager::default()
            .with_liveness(Arc::new(FixedLiveness(HashSet::new())));
        let mut events = manager.subscribe();

        let stale = manager
            .acquire(key("a.rs"), dead, LockMode::Exclusive, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(manager.sweep().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;

        let reclaimed = manager.sweep();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].requester, dead);
        assert_eq!(reclaimed[0].state, LockState::Reclaimed);
        assert!(!manager.is_locked(&key("a.rs")));

        // The prior holder learns about it from its handle
        match stale.verify() {
            Err(LockError::ForcedReclaim { holder, .. }) => assert_eq!(holder, dead),
            other => panic!("expected forced reclaim, got {:?}", other),
        }
        let err = crate::Error::from(stale.verify().unwrap_err());
        assert_eq!(err.code(), "E308");
        assert_eq!(err.kind(), crate::error::ErrorKind::LockForcedReclaim);

        // Releasing the reclaimed handle later is harmless
        assert!(!stale.release());

        let mut saw_reclaim = false;
        while let Ok(event) = events.try_recv() {
            saw_reclaim |= event.event_type == LockEventType::ForcedReclaim;
        }
        assert!(saw_reclaim);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_holder_is_never_reclaimed() {
        let alive = ExecutionId::new();
        let manager = ResourceLockManager::default()
            .with_liveness(Arc::new(FixedLiveness(HashSet::from([alive]))));

        let _handle = manager
            .acquire(key("a.rs"), alive, LockMode::Exclusive, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(manager.sweep().is_empty());
        assert!(manager.is_locked(&key("a.rs")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_granted_after_background_reclaim() {
        let dead = ExecutionId::new();
        let manager = ResourceLockManager::new(
            LockConfig::default().with_sweep_interval(Duration::from_secs(1)),
        )
        .with_liveness(Arc::new(FixedLiveness(HashSet::new())));
        let shutdown = CancellationToken::new();
        let sweeper = manager.spawn_sweeper(shutdown.clone());

        let stale = manager
            .acquire(key("db"), dead, LockMode::Exclusive, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        std::mem::forget(stale);

        let started = Instant::now();
        let handle = manager
            .acquire(key("db"), ExecutionId::new(), LockMode::Exclusive, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        // Deadline (3s) plus at most one sweep interval
        assert!(started.elapsed() <= Duration::from_secs(4));
        assert_eq!(handle.mode(), LockMode::Exclusive);

        shutdown.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reclaims_stale_holder_inline() {
        let manager = ResourceLockManager::default();
        let stale = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        std::mem::forget(stale);
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = manager
            .try_acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive)
            .unwrap();
        assert!(fresh.is_some());
    }

    #[tokio::test]
    async fn test_audit_sink_sees_every_event() {
        struct Counting(AtomicUsize);
        impl LockAuditSink for Counting {
            fn record(&self, _event: &LockEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sink = Arc::new(Counting(AtomicUsize::new(0)));
        let manager = ResourceLockManager::default().with_audit_sink(sink.clone());
        let handle = manager
            .acquire(key("a.rs"), ExecutionId::new(), LockMode::Exclusive, None)
            .await
            .unwrap();
        handle.release();

        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_stress() {
        let manager = ResourceLockManager::default();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let m = manager.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let handle = m
                        .acquire(key("hot.rs"), ExecutionId::new(), LockMode::Exclusive, None)
                        .await
                        .unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(handle);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_keys(), 0);
    }
}
