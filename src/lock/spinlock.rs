//! Spin locks.
use core::mem;

use super::{Guard, Lock, RawLock};

/// Mutual exclusion lock that busy waits (spins).
pub struct RawSpinLock {
    /// Name of lock, for panic messages.
    name: &'static str,

    lock: spin::Mutex<()>,
}

/// Locks that busy wait (spin).
pub type SpinLock<T> = Lock<RawSpinLock, T>;
/// Guards of `SpinLock<T>`.
pub type SpinLockGuard<'s, T> = Guard<'s, RawSpinLock, T>;

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: spin::Mutex::new(()),
        }
    }
}

impl RawLock for RawSpinLock {
    fn acquire(&self) {
        // The raw-lock interface splits acquire and release across
        // methods, so the guard cannot be kept on the stack.
        mem::forget(self.lock.lock());
    }

    fn release(&self) {
        debug_assert!(self.lock.is_locked(), "release {}", self.name);
        // SAFETY: paired with the forgotten guard from `acquire`; the
        // holder is releasing.
        unsafe { self.lock.force_unlock() };
    }
}

impl<T> SpinLock<T> {
    /// Returns a new `SpinLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}
