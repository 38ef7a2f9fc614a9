//! Long-held blocking lock.
//!
//! A [`SleepLock`] may be held across slow operations (device I/O) and while the holder is
//! descheduled. Contexts that find it taken are parked on the lock's [`WaitQueue`]; each
//! release wakes exactly one of them. The lock remembers which execution context holds it,
//! so code that requires the lock can check that its caller really is the holder.
//!
//! A sleep lock must never be acquired while the same context holds a spin lock.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::{ContextId, WaitQueue};
use crate::cpu::context_id;

/// A blocking mutual-exclusion lock that records its holder.
pub struct SleepLock<T> {
    locked: AtomicBool,
    holder: AtomicUsize,
    waiters: WaitQueue,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Creates an unlocked sleep lock. `name` only appears in diagnostics.
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(ContextId::NONE.0),
            waiters: WaitQueue::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, parking the caller until it is available.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.waiters
                .wait_while(|| self.locked.load(Ordering::Acquire));
        }
    }

    /// Acquires the lock if it is free, without blocking.
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        self.holder.store(context_id().0, Ordering::Release);
        Some(SleepLockGuard { lock: self })
    }

    /// Returns true if the calling context holds this lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Acquire) && self.holder.load(Ordering::Acquire) == context_id().0
    }

    /// Returns the diagnostic name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a mutable reference to the protected data; no locking is needed with `&mut self`.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        self.holder.store(ContextId::NONE.0, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        self.waiters.wake_one();
    }
}

impl<T> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .field("holder", &self.holder.load(Ordering::Relaxed))
            .finish()
    }
}

/// Exclusive access to the data of a [`SleepLock`]; dropping it releases the lock.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLockGuard<'_, T> {
    /// Returns true if the calling context is the one that acquired the lock.
    ///
    /// A guard can be handed to another context; that context does not become the holder.
    pub fn held_by_caller(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and `&mut self` makes this access unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
