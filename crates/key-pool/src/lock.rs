//! Shared read/write lock guarding the key-state map
//!
//! Many readers (key selection, minimum cooldown) may hold the lock at once;
//! a writer (decay sweep, penalize, remove) excludes everyone else. Guards
//! release on drop, which covers early returns, `?`, unwinding and dropped
//! futures alike.
//!
//! Backed by `tokio::sync::RwLock`, which queues waiters FIFO so a steady
//! stream of readers cannot starve the decay sweep. Acquiring the lock again
//! from a task that already holds it deadlocks; callers must not nest.

use std::ops::{Deref, DerefMut};

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read/write lock with scoped shared and exclusive access.
#[derive(Debug, Default)]
pub struct SharedLock<T> {
    inner: RwLock<T>,
}

/// Shared access to the protected value. Released on drop.
pub struct ReadLocked<'a, T>(RwLockReadGuard<'a, T>);

/// Exclusive access to the protected value. Released on drop.
pub struct WriteLocked<'a, T>(RwLockWriteGuard<'a, T>);

impl<T> SharedLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Wait for shared access.
    pub async fn read_locked(&self) -> ReadLocked<'_, T> {
        ReadLocked(self.inner.read().await)
    }

    /// Wait for exclusive access.
    pub async fn write_locked(&self) -> WriteLocked<'_, T> {
        WriteLocked(self.inner.write().await)
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for ReadLocked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> Deref for WriteLocked<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for WriteLocked<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
