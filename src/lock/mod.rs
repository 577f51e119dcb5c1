//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion,
//! and the wait channel primitive used to sleep while holding a spin lock.
//!
//! Lock discipline: the per-table spin locks (buffer cache, inode table,
//! mount table, registries) are leaves. A thread never sleeps while holding
//! one except through `WaitChannel::sleep`, which releases the lock for the
//! duration of the wait and reacquires it before returning.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;
mod waitchannel;

pub use sleepablelock::{RawSleepableLock, SleepableLock, SleepableLockGuard};
pub use sleeplock::{RawSleepLock, SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
pub use waitchannel::WaitChannel;

/// Low-level lock interface implemented by the raw lock types.
pub trait RawLock {
    /// Acquires the lock, blocking the caller until it is available.
    fn acquire(&self);

    /// Releases the lock.
    fn release(&self);
}

/// A lock that owns its raw lock and the data it protects.
pub struct Lock<R: RawLock, T> {
    pub(super) lock: R,
    pub(super) data: UnsafeCell<T>,
}

// SAFETY: the data is accessed only through a `Guard`, which guarantees
// exclusive access while the raw lock is held.
unsafe impl<R: RawLock + Send + Sync, T: Send> Sync for Lock<R, T> {}
unsafe impl<R: RawLock + Send, T: Send> Send for Lock<R, T> {}

/// Guards that provide exclusive access to the data of a `Lock`.
pub struct Guard<'s, R: RawLock, T> {
    pub(super) lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns its guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: we have exclusive access to the whole lock.
        unsafe { &mut *self.data.get() }
    }

    /// Returns a raw pointer to the inner data without acquiring the lock.
    ///
    /// The caller must ensure that accessing the pointer does not incur a
    /// race; the usual justification is that no other reference to the
    /// protected object can exist.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires the lock.
    ///
    /// Used where a critical section must call code that itself sleeps or
    /// takes other locks.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }

    /// Releases the inner raw lock.
    ///
    /// # Safety
    ///
    /// `raw_release` and `raw_acquire` must always be used as a pair, and
    /// `self` must not be accessed in between.
    pub unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    /// Reacquires the inner raw lock.
    ///
    /// # Safety
    ///
    /// Must follow a `raw_release` on the same guard.
    pub unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the raw lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the raw lock is held and `&mut self` is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
