//! Wait channels: the sleep/wakeup primitive.
//!
//! A thread that must wait for a condition while holding a spin lock calls
//! `sleep` with the lock's guard. The guard's lock is released and the
//! thread blocks on the channel; `wakeup` resumes every sleeper, which then
//! reacquires the lock before returning. Callers wrap `sleep` in a
//! predicate loop, so spurious wakeups are harmless.

use std::sync::{Condvar, Mutex, PoisonError};

use super::{Guard, RawLock};

pub struct WaitChannel {
    /// Serializes the release-then-wait step against `wakeup`, so a wakeup
    /// cannot be lost between dropping the spin lock and blocking.
    chan: Mutex<()>,
    cond: Condvar,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            chan: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Atomically releases the guard's spin lock and sleeps on this
    /// channel. Reacquires the lock before returning.
    pub fn sleep<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        let chan = self.chan.lock().unwrap_or_else(PoisonError::into_inner);
        // The channel mutex is held, so a concurrent wakeup cannot slip in
        // between releasing the spin lock and blocking on the condvar.
        // SAFETY: paired with raw_acquire below; the guard is not accessed
        // in between.
        unsafe { guard.raw_release() };
        let chan = self
            .cond
            .wait(chan)
            .unwrap_or_else(PoisonError::into_inner);
        drop(chan);
        // SAFETY: paired with the raw_release above.
        unsafe { guard.raw_acquire() };
    }

    /// Wakes up all threads sleeping on this channel.
    pub fn wakeup(&self) {
        let _chan = self.chan.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
