//! Per-device superblocks.
//!
//! There is one superblock slot per minor; it carries the device's logical
//! block size and the backend-specific parsed image. A slot is installed
//! by the backend's `readsb` when the device is mounted and owned by the
//! mount that installed it.

use array_macro::array;
use arrayvec::ArrayVec;
use std::sync::Arc;

use super::ext2::Ext2SbInfo;
use super::s5::{Log, S5SbInfo};
use crate::{
    lock::{SleepableLock, SpinLock},
    param::{BSIZE, NMINOR},
};

/// The backend-specific half of a superblock.
pub enum SbInfo {
    Empty,
    S5(S5SbInfo),
    Ext2(Ext2SbInfo),
}

pub struct Superblock {
    pub major: u32,
    pub minor: u32,
    /// Logical block size of the device; buffer transfers move this many
    /// bytes.
    pub blocksize: usize,
    pub loaded: bool,
    pub info: SbInfo,
}

impl Superblock {
    fn empty() -> Self {
        Self {
            major: 0,
            minor: 0,
            blocksize: BSIZE,
            loaded: false,
            info: SbInfo::Empty,
        }
    }
}

pub struct SbTable {
    slots: [SpinLock<Superblock>; NMINOR],
}

impl SbTable {
    pub fn new() -> Self {
        Self {
            slots: array![_ => SpinLock::new("sb", Superblock::empty()); NMINOR],
        }
    }

    /// Runs `f` with the superblock of `minor`. The lock is not held
    /// across I/O; callers copy out what they need.
    pub fn with<R>(&self, minor: u32, f: impl FnOnce(&Superblock) -> R) -> R {
        let sb = self.slots[minor as usize].lock();
        f(&sb)
    }

    pub fn with_mut<R>(&self, minor: u32, f: impl FnOnce(&mut Superblock) -> R) -> R {
        let mut sb = self.slots[minor as usize].lock();
        f(&mut sb)
    }

    pub fn blocksize(&self, minor: u32) -> usize {
        self.with(minor, |sb| sb.blocksize)
    }

    /// The native log of `minor`, when a native filesystem is loaded
    /// there.
    pub fn s5_log(&self, minor: u32) -> Option<Arc<SleepableLock<Log>>> {
        self.with(minor, |sb| match &sb.info {
            SbInfo::S5(s5) => Some(s5.log.clone()),
            _ => None,
        })
    }

    /// Every active native log, for the transaction bracket.
    pub fn active_s5_logs(&self) -> ArrayVec<(u32, Arc<SleepableLock<Log>>), NMINOR> {
        let mut logs = ArrayVec::new();
        for (minor, slot) in self.slots.iter().enumerate() {
            let sb = slot.lock();
            if sb.loaded {
                if let SbInfo::S5(s5) = &sb.info {
                    logs.push((minor as u32, s5.log.clone()));
                }
            }
        }
        logs
    }

    /// Releases the superblock of `minor` on unmount.
    pub fn unload(&self, minor: u32) {
        let mut sb = self.slots[minor as usize].lock();
        *sb = Superblock::empty();
    }
}
