//! Sleep Lock
//!
//! Exclusive lock that may be held across blocking device I/O.
//!
//! # Design
//!
//! - A waiter parks on a condition variable instead of spinning
//! - The lock records which thread holds it, so `holding()` can answer
//!   "do I own this" the way buffer write-back and release require
//! - The inner mutex is only held long enough to flip the holder field
//!
//! The lock is not reentrant: a thread that locks a buffer it already holds
//! waits forever.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Blocking exclusive lock guarding a buffer payload
pub struct SleepLock<T: ?Sized> {
    /// Thread currently holding the lock
    holder: Mutex<Option<ThreadId>>,
    /// Signalled whenever the lock is released
    released: Condvar,
    /// Name for diagnostics
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: the payload is only reachable through a SleepLockGuard and the
// holder field admits at most one guard at a time
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Create an unlocked sleep lock
    pub fn new(data: T, name: &'static str) -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Acquire the lock, parking the calling thread until it is free
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut holder = self.holder.lock();
        while holder.is_some() {
            self.released.wait(&mut holder);
        }
        *holder = Some(thread::current().id());
        drop(holder);

        SleepLockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Acquire the lock only if nobody holds it
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        let mut holder = self.holder.lock();
        if holder.is_some() {
            return None;
        }
        *holder = Some(thread::current().id());
        drop(holder);

        Some(SleepLockGuard {
            lock: self,
            _marker: PhantomData,
        })
    }

    /// True if the calling thread holds the lock
    pub fn holding(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    /// True if any thread holds the lock
    pub fn is_locked(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Lock name
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unlock(&self) {
        let mut holder = self.holder.lock();
        *holder = None;
        self.released.notify_one();
    }
}

impl<T: ?Sized> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("name", &self.name)
            .field("holder", &*self.holder.lock())
            .finish()
    }
}

/// Proof of holding a [`SleepLock`]; releases it on drop
///
/// The guard may move to another thread. It keeps the lock locked there, but
/// `holding()` reports false on any thread other than the one that acquired it.
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<T: ?Sized> SleepLockGuard<'_, T> {
    /// True if the calling thread is the one that acquired this guard
    pub fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard is the only live handle to the payload
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard is the only live handle to the payload
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<T: ?Sized> fmt::Debug for SleepLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLockGuard")
            .field("lock", &self.lock.name)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
