//! A spinlock for the short critical sections on the send path.
//!
//! Waiters spin a bounded number of times and then start yielding to the scheduler, courtesy of crossbeam's
//! [Backoff].  This is only appropriate when the lock is held for a handful of memory operations; anything that might
//! block belongs behind a real mutex.
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::Backoff;

#[derive(Debug, Default)]
pub struct Spinlock {
    taken: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Spinlock {
        Spinlock {
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning and then yielding until it is free.
    pub fn take(&self) {
        let backoff = Backoff::new();

        loop {
            if self.try_take() {
                return;
            }

            // Only retry the exchange once the lock looks free, so waiters don't bounce the cache line.
            while self.taken.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Try to acquire the lock exactly once.
    pub fn try_take(&self) -> bool {
        self.taken
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.  Does not check that the caller holds it.
    pub fn release(&self) {
        self.taken.store(false, Ordering::Release);
    }

    /// Snapshot of whether the lock is held.  Stale as soon as it returns; for diagnostics only.
    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }
}

/// A value guarded by a [Spinlock].
#[derive(Debug, Default)]
pub struct SpinMutex<T> {
    lock: Spinlock,
    value: UnsafeCell<T>,
}

// Safety: access to the value is serialized by the lock, exactly as for `std::sync::Mutex`.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> SpinMutex<T> {
        SpinMutex {
            lock: Spinlock::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.lock.take();
        SpinGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.lock.try_take() {
            Some(SpinGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_taken()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

/// Holds a [SpinMutex] locked until dropped.
pub struct SpinGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<'a, T> Deref for SpinGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, T> DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}
