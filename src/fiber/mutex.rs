use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
};

use crate::fiber::scheduler::Scheduler;
use crate::fiber::Latch;

////////////////////////////////////////////////////////////////////////////////
// Mutex
////////////////////////////////////////////////////////////////////////////////

/// A fiber-blocking mutual-exclusion lock. Unlike `std::sync::Mutex`, the
/// exclusion is cooperative: a fiber blocked on `lock()` suspends and lets
/// other fibers run rather than spinning or parking an OS thread, which is
/// why construction requires the owning loop (`Loop::make_mutex`) rather
/// than being a bare `T -> Mutex<T>` conversion.
pub struct Mutex<T: ?Sized> {
    latch: UnsafeCell<Latch>,
    data: UnsafeCell<T>,
}

impl<T: ?Sized> Mutex<T> {
    pub(crate) fn new(scheduler: *mut Scheduler, t: T) -> Mutex<T>
    where
        T: Sized,
    {
        Mutex {
            latch: UnsafeCell::new(Latch::new(scheduler)),
            data: UnsafeCell::new(t),
        }
    }

    fn latch(&self) -> &mut Latch {
        unsafe { &mut *self.latch.get() }
    }

    /// Acquires the lock, suspending the current fiber until it is able
    /// to do so. Upon return the current fiber is the sole holder; the
    /// returned guard releases it on drop.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.latch().lock();
        unsafe { MutexGuard::new(self) }
    }

    /// Attempts to acquire the lock without suspending. Returns `None` if
    /// it is already held.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.latch().try_lock() {
            Some(unsafe { MutexGuard::new(self) })
        } else {
            None
        }
    }

    /// Equivalent to `drop(guard)`, spelled out for readers unfamiliar
    /// with the RAII idiom.
    pub fn unlock(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }

    /// A mutable borrow of the mutex statically proves exclusivity, so
    /// this bypasses the latch entirely.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => {
                d.field("data", &&*guard);
            }
            None => {
                struct LockedPlaceholder;
                impl fmt::Debug for LockedPlaceholder {
                    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("<locked>")
                    }
                }
                d.field("data", &LockedPlaceholder);
            }
        }
        d.finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
}

impl<'mutex, T: ?Sized> MutexGuard<'mutex, T> {
    unsafe fn new(lock: &'mutex Mutex<T>) -> Self {
        Self { lock }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.latch().unlock();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + fmt::Display> fmt::Display for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}
