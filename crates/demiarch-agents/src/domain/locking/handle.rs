//! Lock handles
//!
//! A [`LockHandle`] is the proof of a granted lock. Dropping it releases the
//! lock, so a lock is returned on every exit path of the task holding it,
//! including errors and panics.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::manager::ResourceLockManager;
use super::types::{LockError, LockMode, LockRecord, LockResult, ResourceKey};
use crate::domain::execution::ExecutionId;

/// A granted lock, released on drop
pub struct LockHandle {
    manager: ResourceLockManager,
    record: LockRecord,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(manager: ResourceLockManager, record: LockRecord) -> Self {
        Self {
            manager,
            record,
            released: AtomicBool::new(false),
        }
    }

    /// Lock ID
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn key(&self) -> &ResourceKey {
        &self.record.key
    }

    pub fn mode(&self) -> LockMode {
        self.record.mode
    }

    pub fn holder(&self) -> ExecutionId {
        self.record.requester
    }

    /// Instant after which the lock may be reclaimed
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.record.deadline
    }

    /// The lock record as of the grant
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Whether this handle has been released
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Fails with [`LockError::ForcedReclaim`] when the lease expired and
    /// the lock was taken back before this handle released it
    pub fn verify(&self) -> LockResult<()> {
        if self.is_released() || self.manager.is_granted(&self.record.key, self.record.id) {
            return Ok(());
        }
        Err(LockError::ForcedReclaim {
            resource: self.record.key.to_string(),
            holder: self.record.requester,
        })
    }

    /// Release the lock
    ///
    /// Returns `true` only for the call that actually returned the lock to the
    /// table. Later calls, and calls after the lock was forcibly reclaimed,
    /// return `false`.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.manager.release_lock(&self.record.key, self.record.id)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("id", &self.record.id)
            .field("key", &self.record.key.to_string())
            .field("mode", &self.record.mode)
            .field("holder", &self.record.requester)
            .field("released", &self.is_released())
            .finish()
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}:{}]", self.record.mode, self.record.key)
    }
}

/// The set of locks one execution holds for a step
///
/// Locks are released in reverse acquisition order.
#[derive(Debug, Default)]
pub struct LockSet {
    handles: Vec<LockHandle>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: LockHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.handles.iter().map(|h| h.key())
    }

    /// First lock of the set that was forcibly reclaimed, if any
    pub fn verify(&self) -> LockResult<()> {
        self.handles.iter().try_for_each(LockHandle::verify)
    }

    /// Release every lock in the set, returning how many were actually released
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        while let Some(handle) = self.handles.pop() {
            if handle.release() {
                released += 1;
            }
        }
        released
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}
