//! The mount table.
//!
//! One entry per mounted minor, binding the mount-point inode (on the
//! parent filesystem) to the mounted filesystem's root inode. Entries keep
//! a reference on both inodes for as long as the mount lives; the
//! references travel with the entry and are released by whoever removes
//! it.

use arrayvec::ArrayVec;

use super::RcInode;
use crate::{lock::SpinLock, param::NMINOR};

pub struct MountEntry {
    /// Minor of the mounted device.
    pub dev: u32,
    /// (dev, inum) of the directory mounted over.
    pub mp: (u32, u32),
    /// Root inode number of the mounted filesystem.
    pub root_inum: u32,
    /// Reference held on the mount-point inode.
    pub mp_ip: RcInode,
    /// Reference held on the mounted filesystem's root inode.
    pub root_ip: RcInode,
}

pub struct MountTable {
    entries: SpinLock<ArrayVec<MountEntry, NMINOR>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new("mtable", ArrayVec::new()),
        }
    }

    /// Records a mount. Refuses a minor that is already mounted, handing
    /// the rejected entry back so the caller can release its references.
    /// Mounting on a point that already anchors a mount reuses its slot;
    /// the displaced entry (with the references it holds) is returned for
    /// the caller to dispose of.
    pub fn insert(&self, entry: MountEntry) -> Result<Option<MountEntry>, MountEntry> {
        let mut entries = self.entries.lock();
        if entries.iter().any(|e| e.dev == entry.dev) {
            // The disk is already mounted.
            return Err(entry);
        }
        if let Some(pos) = entries.iter().position(|e| e.mp == entry.mp) {
            let old = core::mem::replace(&mut entries[pos], entry);
            return Ok(Some(old));
        }
        if entries.try_push(entry).is_err() {
            panic!("mount: out of mount slots");
        }
        Ok(None)
    }

    /// Removes the entry for mounted minor `dev`, handing its references
    /// back to the caller.
    pub fn remove(&self, dev: u32) -> Option<MountEntry> {
        let mut entries = self.entries.lock();
        let pos = entries.iter().position(|e| e.dev == dev)?;
        Some(entries.swap_remove(pos))
    }

    /// Given a mount-point inode, the (dev, inum) of the root of the
    /// filesystem mounted on it.
    pub fn root_of_mountpoint(&self, dev: u32, inum: u32) -> Option<(u32, u32)> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.mp == (dev, inum))
            .map(|e| (e.dev, e.root_inum))
    }

    /// Given the device of a mounted filesystem, the (dev, inum) of the
    /// directory it is mounted over.
    pub fn mountpoint_of(&self, dev: u32) -> Option<(u32, u32)> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.dev == dev)
            .map(|e| e.mp)
    }

    /// Whether (dev, inum) is the root inode of a mounted filesystem.
    pub fn is_fs_root(&self, dev: u32, inum: u32) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.dev == dev && e.root_inum == inum)
    }

    /// Number of live mounts; the root filesystem is not a mount-table
    /// entry.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
