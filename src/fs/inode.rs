//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links
//! referring to it, and the list of blocks holding the file's content.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple threads. The
//! in-memory inodes include book-keeping information that is not stored on
//! disk: the reference count and the `valid` flag.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file system code.
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   The backend's `ialloc` allocates, and `RcInode::free` frees if the
//!   reference and link counts have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if its
//!   reference count is zero. Otherwise it tracks the number of in-memory
//!   handles to the entry (open files and current directories).
//!   `Itable::get` finds or creates a table entry and increments its ref;
//!   `RcInode::free` decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only
//!   correct when `valid` is set. `RcInode::lock` reads the inode from the
//!   disk through the backend's `fill` and sets `valid`, while the free
//!   path clears it when the on-disk inode is released.
//!
//! * Locked: file system code may only examine and modify the information
//!   in an inode and its content if it has first locked the inode.
//!
//! Thus a typical sequence is:
//!   let ip = itable.get(dev, inum);
//!   let guard = ip.lock(k);
//!   ... examine and modify through the guard ...
//!   drop(guard);
//!   ip.free(k);
//!
//! Locking is separate from `get` so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g., in read). The separation also helps avoid
//! deadlock and races during pathname lookup.
//!
//! The table spin lock protects the reference counts and the (dev, inum)
//! keys. The per-inode sleep lock protects everything else: one must hold
//! it to read or write the inode's `valid`, `typ`, `size`, `nlink` or the
//! backend-private state.
//!
//! One extra wrinkle over the classic design: when `Itable::get` finds a
//! cached inode whose type was flipped to `Mount`, it transparently
//! returns a reference to the mounted filesystem's root inode instead, so
//! path traversal crosses mount points without noticing them.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use array_macro::array;

use super::{ext2::Ext2Priv, s5::S5Priv, InodeOps, InodeType, Tx};
use crate::{
    kernel::Kernel,
    lock::{SleepLock, SleepLockGuard, SpinLock},
    param::{IDEMAJOR, NINODE},
    stat::Stat,
};

/// Backend-private half of an in-memory inode.
pub enum IPriv {
    None,
    S5(S5Priv),
    Ext2(Ext2Priv),
}

/// The part of an in-memory inode protected by its sleep lock.
pub struct InodeInner {
    /// Inode has been read from disk?
    pub valid: bool,
    /// Copy of disk inode.
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,
    /// Backend-private data (block addresses for the native backend, the
    /// raw inode record for ext2).
    pub ip: IPriv,
}

/// In-memory copy of an inode.
pub struct Inode {
    /// Device number. Written only while the slot is unreferenced, under
    /// the table lock.
    dev: AtomicU32,

    /// Inode number.
    inum: AtomicU32,

    /// Index of the filesystem type this inode dispatches through, bound
    /// when the slot is (re)used.
    fst: AtomicUsize,

    /// Mirrors `typ == Mount` so `Itable::get` can redirect without taking
    /// the sleep lock.
    mounted: AtomicBool,

    pub inner: SleepLock<InodeInner>,
}

impl Inode {
    fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            inum: AtomicU32::new(0),
            fst: AtomicUsize::new(0),
            mounted: AtomicBool::new(false),
            inner: SleepLock::new(
                "inode",
                InodeInner {
                    valid: false,
                    typ: InodeType::None,
                    nlink: 0,
                    size: 0,
                    ip: IPriv::None,
                },
            ),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev.load(Ordering::Acquire)
    }

    pub fn inum(&self) -> u32 {
        self.inum.load(Ordering::Acquire)
    }

    pub fn fst(&self) -> usize {
        self.fst.load(Ordering::Acquire)
    }
}

/// The in-memory inode table.
pub struct Itable {
    /// Per-slot reference counts.
    ctl: SpinLock<[u32; NINODE]>,
    inodes: [Inode; NINODE],
}

/// A counted reference to an inode table entry.
///
/// Handles are created by `Itable::get` and duplicated with `dup`; every
/// handle must eventually be passed to `free`. Dropping a handle without
/// freeing it leaks the reference (the entry stays cached forever).
#[must_use]
pub struct RcInode {
    idx: usize,
}

/// Holding an `InodeGuard` means the inode's sleep lock is held and its
/// metadata is valid.
pub struct InodeGuard<'s> {
    pub inode: &'s Inode,
    guard: SleepLockGuard<'s, InodeInner>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            ctl: SpinLock::new("itable", [0; NINODE]),
            inodes: array![_ => Inode::new(); NINODE],
        }
    }

    /// Finds the inode with number `inum` on device `dev` and returns a
    /// reference to its in-memory copy. Does not lock the inode and does
    /// not read it from disk.
    ///
    /// If the inode is a mount point, returns the mounted filesystem's
    /// root inode instead.
    pub fn get(&self, k: &Kernel, dev: u32, inum: u32) -> RcInode {
        self.geti(k, dev, inum, true)
    }

    /// Like `get`, but without mount-point substitution. The mount table
    /// and `..` traversal use this to reach the mount-point inode itself.
    pub fn get_raw(&self, k: &Kernel, dev: u32, inum: u32) -> RcInode {
        self.geti(k, dev, inum, false)
    }

    fn geti(&self, k: &Kernel, dev: u32, inum: u32, substitute: bool) -> RcInode {
        let mut ctl = self.ctl.lock();

        // Is the inode already cached?
        let mut empty = None;
        for i in 0..NINODE {
            let ip = &self.inodes[i];
            if ctl[i] > 0 && ip.dev() == dev && ip.inum() == inum {
                if substitute && ip.mounted.load(Ordering::Acquire) {
                    // A mounted-over directory: hand out the root of the
                    // filesystem mounted on it.
                    let (rdev, rinum) = k
                        .mtable()
                        .root_of_mountpoint(dev, inum)
                        .expect("iget: mount point without mount entry");
                    for j in 0..NINODE {
                        let rp = &self.inodes[j];
                        if ctl[j] > 0 && rp.dev() == rdev && rp.inum() == rinum {
                            ctl[j] += 1;
                            return RcInode { idx: j };
                        }
                    }
                    panic!("iget: mount root not cached");
                }
                ctl[i] += 1;
                return RcInode { idx: i };
            }
            if empty.is_none() && ctl[i] == 0 {
                empty = Some(i);
            }
        }

        // Recycle an inode table entry.
        let i = empty.expect("iget: no inodes");
        let ip = &self.inodes[i];
        ip.dev.store(dev, Ordering::Release);
        ip.inum.store(inum, Ordering::Release);
        ip.mounted.store(false, Ordering::Release);

        let fst = k
            .vfslist()
            .get(IDEMAJOR, dev)
            .expect("iget: device has no filesystem");
        ip.fst.store(fst, Ordering::Release);

        // SAFETY: the slot's reference count is 0 and the table lock is
        // held, so no thread holds or can take this inode's lock.
        let inner = unsafe { &mut *ip.inner.get_mut_raw() };
        inner.valid = false;
        k.fstype(fst).iops.cleanup(inner);

        ctl[i] = 1;
        RcInode { idx: i }
    }

    pub(crate) fn nref(&self, idx: usize) -> u32 {
        self.ctl.lock()[idx]
    }

    /// Whether device `dev` has referenced inodes beyond its root, or the
    /// root itself is referenced by more than the mount table. Used to
    /// refuse unmounting a busy filesystem.
    pub fn busy_on_dev(&self, dev: u32, root_inum: u32) -> bool {
        let ctl = self.ctl.lock();
        for i in 0..NINODE {
            if ctl[i] > 0 && self.inodes[i].dev() == dev {
                if self.inodes[i].inum() != root_inum || ctl[i] > 1 {
                    return true;
                }
            }
        }
        false
    }
}

impl RcInode {
    pub fn dev(&self, k: &Kernel) -> u32 {
        k.itable().inodes[self.idx].dev()
    }

    pub fn inum(&self, k: &Kernel) -> u32 {
        k.itable().inodes[self.idx].inum()
    }

    pub fn nref(&self, k: &Kernel) -> u32 {
        k.itable().nref(self.idx)
    }

    /// Increments the reference count and returns a second handle.
    pub fn dup(&self, k: &Kernel) -> RcInode {
        let mut ctl = k.itable().ctl.lock();
        ctl[self.idx] += 1;
        RcInode { idx: self.idx }
    }

    /// Locks the inode, reading its metadata from disk if it has not been
    /// read yet.
    pub fn lock<'s>(&self, k: &'s Kernel) -> InodeGuard<'s> {
        let inode = &k.itable().inodes[self.idx];
        let mut guard = inode.inner.lock();
        if !guard.valid {
            let fst = k.fstype(inode.fst());
            fst.iops.fill(k, inode, &mut guard);
            guard.valid = true;
            assert!(guard.typ != InodeType::None, "ilock: no type");
        }
        InodeGuard { inode, guard }
    }

    /// Copies stat information out of the inode.
    pub fn stat(&self, k: &Kernel) -> Stat {
        let guard = self.lock(k);
        let st = k.fstype(guard.inode.fst()).iops.stati(k, &guard);
        st
    }

    /// Drops a reference to an in-memory inode.
    ///
    /// If that was the last reference, the table entry can be recycled.
    /// If that was the last reference and the inode has no links to it,
    /// the inode (and its content) is freed on disk; the caller must be
    /// inside a transaction in that case.
    pub fn free(self, k: &Kernel) {
        let itable = k.itable();
        let i = self.idx;
        let mut ctl = itable.ctl.lock();
        if ctl[i] == 1 {
            let must_free = {
                // SAFETY: this is the last reference and the table lock is
                // held, so no other thread holds or can take this inode's
                // lock.
                let inner = unsafe { &*itable.inodes[i].inner.get_mut_raw() };
                inner.valid && inner.nlink == 0
            };
            if must_free {
                // The inode has no links and no other references: truncate
                // and free it on disk. A reference count of 1 also means no
                // directory entry names the inode anymore, so nobody can
                // reach it while the table lock is dropped below.
                ctl.reacquire_after(|| {
                    // A transaction is already open in the caller; disk
                    // writes ride on it.
                    let tx = Tx::assume_active(k);
                    let handle = RcInode { idx: i };
                    let fst = k.fstype(k.itable().inodes[i].fst());
                    let mut ip = handle.lock(k);
                    fst.iops.itrunc(k, &tx, &mut ip);
                    ip.typ = InodeType::None;
                    fst.iops.iupdate(k, &tx, &ip);
                    ip.valid = false;
                    drop(ip);
                });
            }
        }
        ctl[i] -= 1;
    }

    /// Marks (or unmarks) the inode as a mount point for the lock-free
    /// check in `Itable::get`. Callers also flip `typ` under the guard.
    pub(crate) fn set_mounted(&self, k: &Kernel, mounted: bool) {
        k.itable().inodes[self.idx]
            .mounted
            .store(mounted, Ordering::Release);
    }
}

impl InodeGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.inode.dev()
    }

    pub fn inum(&self) -> u32 {
        self.inode.inum()
    }

    pub fn read(
        &mut self,
        k: &Kernel,
        dst: &mut [u8],
        off: u32,
    ) -> Result<usize, crate::error::KernelError> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.readi(k, self, dst, off)
    }

    pub fn write(
        &mut self,
        k: &Kernel,
        tx: &Tx<'_>,
        src: &[u8],
        off: u32,
    ) -> Result<usize, crate::error::KernelError> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.writei(k, tx, self, src, off)
    }

    /// Copies the modified in-memory inode to disk.
    pub fn update(&self, k: &Kernel, tx: &Tx<'_>) {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.iupdate(k, tx, self)
    }

    pub fn trunc(&mut self, k: &Kernel, tx: &Tx<'_>) {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.itrunc(k, tx, self)
    }

    pub fn dirlookup(
        &mut self,
        k: &Kernel,
        name: &[u8],
    ) -> Result<(RcInode, u32), crate::error::KernelError> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.dirlookup(k, self, name)
    }

    pub fn dirlink(
        &mut self,
        k: &Kernel,
        tx: &Tx<'_>,
        name: &[u8],
        inum: u32,
    ) -> Result<(), crate::error::KernelError> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.dirlink(k, tx, self, name, inum)
    }

    pub fn unlink_at(
        &mut self,
        k: &Kernel,
        tx: &Tx<'_>,
        off: u32,
    ) -> Result<(), crate::error::KernelError> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.unlink(k, tx, self, off)
    }

    pub fn is_dir_empty(&mut self, k: &Kernel) -> bool {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.isdirempty(k, self)
    }

    pub fn readdir(&mut self, k: &Kernel, off: u32) -> Option<super::DirEnt> {
        let iops = k.fstype(self.inode.fst()).iops;
        iops.readdir(k, self, off)
    }
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl core::ops::DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
