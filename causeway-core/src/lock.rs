//! Named locks acquired by command logic.
//!
//! ```text
//! LockProvider ── lock(key) ──→ Box<dyn Lock>
//!      ▲
//!      │ delegates
//! TrackingLockProvider (one per command execution)
//!      └── records every lock it hands out; release() / Drop unlocks the rest
//! ```
//!
//! Commands never own the underlying lock: the per-execution
//! [`TrackingLockProvider`] does, so leaving its scope releases everything a
//! command acquired even if the command forgot to unlock or failed halfway.

use crate::LockError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A held named lock.
pub trait Lock: Send + Sync {
    fn key(&self) -> &str;

    /// Release the lock. Unlocking twice is a no-op.
    fn unlock(&self);

    fn is_locked(&self) -> bool;
}

/// Source of named locks. `lock` blocks until the key is free.
pub trait LockProvider: Send + Sync {
    fn lock(&self, key: &str) -> Result<Box<dyn Lock>, LockError>;
}

// ============================================================================
// LOCAL LOCK PROVIDER
// ============================================================================

#[derive(Default)]
struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    fn unlock(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(key);
        drop(held);
        self.released.notify_all();
    }
}

/// In-process lock provider keyed by string.
#[derive(Clone, Default)]
pub struct LocalLockProvider {
    table: Arc<LockTable>,
    timeout: Option<Duration>,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up with [`LockError::Timeout`] after waiting `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            table: Arc::default(),
            timeout: Some(timeout),
        }
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

impl LockProvider for LocalLockProvider {
    fn lock(&self, key: &str) -> Result<Box<dyn Lock>, LockError> {
        let started = Instant::now();
        let mut held = self.table.held.lock().map_err(|_| LockError::Poisoned)?;
        while held.contains(key) {
            held = match self.timeout {
                None => self.table.released.wait(held).map_err(|_| LockError::Poisoned)?,
                Some(timeout) => {
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(LockError::Timeout {
                            key: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    self.table
                        .released
                        .wait_timeout(held, remaining)
                        .map_err(|_| LockError::Poisoned)?
                        .0
                }
            };
        }
        held.insert(key.to_string());
        Ok(Box::new(LocalLock {
            key: key.to_string(),
            table: Arc::clone(&self.table),
            locked: AtomicBool::new(true),
        }))
    }
}

impl fmt::Debug for LocalLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLockProvider")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct LocalLock {
    key: String,
    table: Arc<LockTable>,
    locked: AtomicBool,
}

impl Lock for LocalLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn unlock(&self) {
        if self.locked.swap(false, Ordering::SeqCst) {
            self.table.unlock(&self.key);
        }
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TRACKING LOCK PROVIDER
// ============================================================================

type HeldLocks = Arc<Mutex<HashMap<u64, Box<dyn Lock>>>>;

/// Per-execution facade that remembers every lock it hands out.
///
/// [`release`](Self::release) force-unlocks whatever is still recorded and is
/// idempotent. Dropping the provider releases as well.
pub struct TrackingLockProvider {
    inner: Arc<dyn LockProvider>,
    held: HeldLocks,
    next_id: AtomicU64,
}

impl TrackingLockProvider {
    pub fn new(inner: Arc<dyn LockProvider>) -> Self {
        Self {
            inner,
            held: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of locks acquired through this provider and not yet unlocked.
    pub fn tracked(&self) -> usize {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Unlock every lock still held. Returns how many were released.
    pub fn release(&self) -> usize {
        let drained: Vec<Box<dyn Lock>> = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, lock)| lock)
            .collect();
        for lock in &drained {
            lock.unlock();
        }
        if !drained.is_empty() {
            tracing::trace!(count = drained.len(), "Released tracked locks");
        }
        drained.len()
    }
}

impl LockProvider for TrackingLockProvider {
    fn lock(&self, key: &str) -> Result<Box<dyn Lock>, LockError> {
        let lock = self.inner.lock(key)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, lock);
        Ok(Box::new(TrackedLock {
            id,
            key: key.to_string(),
            held: Arc::clone(&self.held),
        }))
    }
}

impl Drop for TrackingLockProvider {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TrackingLockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingLockProvider")
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

/// Handle returned to command logic. Unlocking removes it from the tracked set.
struct TrackedLock {
    id: u64,
    key: String,
    held: HeldLocks,
}

impl Lock for TrackedLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn unlock(&self) {
        let removed = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        if let Some(lock) = removed {
            lock.unlock();
        }
    }

    fn is_locked(&self) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.id)
            .map(|lock| lock.is_locked())
            .unwrap_or(false)
    }
}

// ============================================================================
// TESTS
// ============================================================================
