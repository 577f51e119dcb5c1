//! Virtual file system layer.
//!
//! The VFS multiplexes several on-disk filesystem layouts behind one pair
//! of dispatch tables, bound to every in-memory inode when it enters the
//! cache:
//!
//! * `VfsOps`: whole-filesystem operations (superblock read, mount, block
//!   and inode allocation).
//! * `InodeOps`: per-inode operations (lookup, block mapping, read, write,
//!   truncate).
//!
//! Layers below are the buffer cache and the block device switch; layers
//! above are path resolution, the mount table, and the file-system calls.
//!
//! The traits ship generic implementations (`readi`, `stati`, `dirlink`,
//! `readdir`, `cleanup`) that concrete filesystems opt into by not
//! overriding them; a backend overrides exactly the operations whose
//! layout it owns.

use core::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    bio::Buf,
    error::KernelError,
    kernel::Kernel,
    lock::{SleepableLock, SpinLock},
    param::{NMINOR, NVFSSW},
    stat::{Stat, T_DEV, T_DIR, T_FILE, T_MOUNT},
};

mod inode;
mod mount;
mod path;
mod superblock;

pub mod ext2;
pub mod s5;

pub use inode::{IPriv, Inode, InodeGuard, InodeInner, Itable, RcInode};
pub use mount::{MountEntry, MountTable};
pub use path::{FileName, Path};
pub use superblock::{SbInfo, SbTable, Superblock};

use self::s5::Log;

/// Directory entries of the native format carry at most this many name
/// bytes; path components are truncated to it as well.
pub const DIRSIZ: usize = 14;

/// dirent size
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// Longest name a `readdir` entry can carry (the ext2 limit).
pub const MAXNAMELEN: usize = 255;

/// File type of an in-memory inode.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
    /// A directory hidden behind a mounted filesystem; `iget` substitutes
    /// the mounted root for inodes of this type.
    Mount,
}

impl InodeType {
    pub fn tag(self) -> i16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => T_DIR,
            InodeType::File => T_FILE,
            InodeType::Device { .. } => T_DEV,
            InodeType::Mount => T_MOUNT,
        }
    }
}

/// A directory entry of the native fixed on-disk format.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

const_assert!(DIRENT_SIZE == 16);

impl Default for Dirent {
    fn default() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }
}

impl Dirent {
    /// Fill in name. If name is shorter than DIRSIZ, a NUL character is
    /// appended as terminator.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(DIRSIZ);
        if len == DIRSIZ {
            self.name.copy_from_slice(&name[..DIRSIZ]);
        } else {
            self.name[..len].copy_from_slice(&name[..len]);
            self.name[len] = 0;
        }
    }

    /// Returns the slice that exactly contains the name.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

/// One entry produced by `InodeOps::readdir`.
pub struct DirEnt {
    pub inum: u32,
    pub name: ArrayVec<u8, MAXNAMELEN>,
    /// Offset of the next entry; pass it back to continue the walk.
    pub off: u32,
}

/// Whole-filesystem operations of a filesystem type.
pub trait VfsOps: Send + Sync {
    /// One-time initialization when the type is registered.
    fn fs_init(&self, _k: &Kernel) -> Result<(), KernelError> {
        Ok(())
    }

    /// Reads the superblock of device (`major`, `minor`), obtains the
    /// filesystem root inode and records the mount in the mount table.
    /// `mp` is the directory the filesystem is mounted over.
    fn mount(&self, k: &Kernel, major: u32, minor: u32, mp: &RcInode) -> Result<(), KernelError>;

    /// Detaches the filesystem on `minor`, releasing the mount-table entry
    /// and the references it holds.
    fn unmount(&self, k: &Kernel, minor: u32) -> Result<(), KernelError>;

    /// Returns a reference to the filesystem's root inode.
    fn getroot(&self, k: &Kernel, major: u32, minor: u32) -> RcInode;

    /// Parses the on-disk superblock of `minor` into the superblock table.
    fn readsb(&self, k: &Kernel, minor: u32);

    /// Allocates an on-disk inode of type `typ` and returns a reference.
    fn ialloc(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, typ: InodeType) -> RcInode;

    /// Allocates a zeroed disk block.
    fn balloc(&self, k: &Kernel, tx: &Tx<'_>, dev: u32) -> u32;

    /// Zeroes disk block `bno`.
    fn bzero(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, bno: u32);

    /// Frees disk block `b`.
    fn bfree(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, b: u32);

    /// Compares a path component against a directory-entry name.
    fn namecmp(&self, a: &[u8], b: &[u8]) -> bool;

    /// Inode number of the filesystem root.
    fn rootino(&self) -> u32;
}

/// Per-inode operations of a filesystem type.
pub trait InodeOps: Send + Sync {
    /// Populates an inode's in-memory copy from disk. Called by the lock
    /// path when the inode is not yet VALID.
    fn fill(&self, k: &Kernel, ip: &Inode, inner: &mut InodeInner);

    /// Copies a modified in-memory inode to disk. Must be called after
    /// every change to an `ip` field that lives on disk.
    fn iupdate(&self, k: &Kernel, tx: &Tx<'_>, ip: &InodeGuard<'_>);

    /// Truncates the inode (discards contents).
    fn itrunc(&self, k: &Kernel, tx: &Tx<'_>, ip: &mut InodeGuard<'_>);

    /// Drops backend-private in-memory state when a cache slot is retired.
    fn cleanup(&self, inner: &mut InodeInner) {
        inner.ip = IPriv::None;
    }

    /// Returns the disk block that holds the `bn`th logical block of the
    /// file, or 0 for a hole.
    fn bmap(&self, k: &Kernel, ip: &mut InodeGuard<'_>, bn: u32) -> u32;

    /// Like `bmap`, but allocates a block (and any needed indirect block)
    /// when the file does not yet have one.
    fn bmap_alloc(&self, k: &Kernel, tx: &Tx<'_>, ip: &mut InodeGuard<'_>, bn: u32) -> u32;

    /// Copies stat information out of the inode.
    fn stati(&self, k: &Kernel, ip: &InodeGuard<'_>) -> Stat {
        let _ = k;
        Stat {
            typ: ip.typ.tag(),
            dev: ip.dev() as i32,
            ino: ip.inum(),
            nlink: ip.nlink,
            size: ip.size as usize,
        }
    }

    /// Reads data from the inode into `dst`, starting at byte `off`.
    ///
    /// Device inodes dispatch to the character-device switch; for the
    /// rest, the request is clipped against the file size and the blocks
    /// are walked through `bmap`. A hole reads as zeroes.
    fn readi(
        &self,
        k: &Kernel,
        ip: &mut InodeGuard<'_>,
        dst: &mut [u8],
        off: u32,
    ) -> Result<usize, KernelError> {
        if let InodeType::Device { major, .. } = ip.typ {
            let read = k.devsw(major).and_then(|d| d.read).ok_or(KernelError::InvalidArgument)?;
            return read(k, dst);
        }

        let size = ip.size;
        let mut n = dst.len() as u32;
        if off > size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }
        let bs = k.blocksize(ip.dev()) as u32;
        let mut tot: u32 = 0;
        while tot < n {
            let bn = self.bmap(k, ip, (off + tot) / bs);
            let m = (n - tot).min(bs - (off + tot) % bs);
            let begin = ((off + tot) % bs) as usize;
            let dst = &mut dst[tot as usize..(tot + m) as usize];
            if bn == 0 {
                // Hole: reads as zeroes.
                dst.iter_mut().for_each(|b| *b = 0);
            } else {
                let bp = k.bread(ip.dev(), bn);
                dst.copy_from_slice(&bp.data()[begin..begin + m as usize]);
            }
            tot += m;
        }
        Ok(tot as usize)
    }

    /// Writes `src` to the inode at byte `off`. Only at or below the
    /// current size; growing writes extend the file.
    fn writei(
        &self,
        k: &Kernel,
        tx: &Tx<'_>,
        ip: &mut InodeGuard<'_>,
        src: &[u8],
        off: u32,
    ) -> Result<usize, KernelError>;

    /// Looks for a directory entry in a directory. If found, returns the
    /// entry's inode and the byte offset of the entry.
    fn dirlookup(
        &self,
        k: &Kernel,
        ip: &mut InodeGuard<'_>,
        name: &[u8],
    ) -> Result<(RcInode, u32), KernelError>;

    /// Writes a new directory entry (`name`, `inum`) into the directory.
    fn dirlink(
        &self,
        k: &Kernel,
        tx: &Tx<'_>,
        dp: &mut InodeGuard<'_>,
        name: &[u8],
        inum: u32,
    ) -> Result<(), KernelError> {
        // Check that name is not present.
        if let Ok((ip, _)) = self.dirlookup(k, dp, name) {
            ip.free(k);
            return Err(KernelError::AlreadyExists);
        }

        // Look for an empty dirent.
        let size = dp.size;
        let mut off = 0;
        while off < size {
            let de = read_dirent(self, k, dp, off);
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        let written = self.writei(k, tx, dp, de.as_bytes(), off)?;
        assert_eq!(written, DIRENT_SIZE, "dirlink");
        Ok(())
    }

    /// Erases the directory entry at byte offset `off`.
    fn unlink(
        &self,
        k: &Kernel,
        tx: &Tx<'_>,
        dp: &mut InodeGuard<'_>,
        off: u32,
    ) -> Result<(), KernelError>;

    /// Is the directory empty except for "." and ".." ?
    fn isdirempty(&self, k: &Kernel, ip: &mut InodeGuard<'_>) -> bool;

    /// Returns the first live directory entry at or after byte offset
    /// `off`, or `None` at end of directory.
    fn readdir(&self, k: &Kernel, ip: &mut InodeGuard<'_>, off: u32) -> Option<DirEnt> {
        let mut off = off - off % DIRENT_SIZE as u32;
        while off < ip.size {
            let de = read_dirent(self, k, ip, off);
            off += DIRENT_SIZE as u32;
            if de.inum == 0 {
                continue;
            }
            let mut name = ArrayVec::new();
            name.try_extend_from_slice(de.name()).unwrap();
            return Some(DirEnt {
                inum: de.inum as u32,
                name,
                off,
            });
        }
        None
    }
}

/// Reads the fixed-format dirent at `off`; the directory must hold a whole
/// entry there.
fn read_dirent<O: InodeOps + ?Sized>(
    ops: &O,
    k: &Kernel,
    dp: &mut InodeGuard<'_>,
    off: u32,
) -> Dirent {
    let mut bytes = [0u8; DIRENT_SIZE];
    let read = ops.readi(k, dp, &mut bytes, off).expect("dirent read");
    assert_eq!(read, DIRENT_SIZE, "dirent read");
    Dirent::read_from(&bytes[..]).unwrap()
}

/// A filesystem type: its name and the two dispatch tables. Registered
/// once, then bound to inodes by index into the switch table.
#[derive(Copy, Clone)]
pub struct FsType {
    pub name: &'static str,
    pub ops: &'static dyn VfsOps,
    pub iops: &'static dyn InodeOps,
}

/// The filesystem switch table: every registered filesystem type.
pub struct Vfssw {
    list: SpinLock<ArrayVec<FsType, NVFSSW>>,
}

impl Vfssw {
    pub fn new() -> Self {
        Self {
            list: SpinLock::new("vfssw", ArrayVec::new()),
        }
    }

    /// Registers a filesystem type under its (unique) name and returns its
    /// index in the switch table.
    pub fn register(&self, fs: FsType) -> Result<usize, KernelError> {
        let mut list = self.list.lock();
        if list.iter().any(|f| f.name == fs.name) {
            return Err(KernelError::AlreadyExists);
        }
        if list.try_push(fs).is_err() {
            return Err(KernelError::Exhausted);
        }
        Ok(list.len() - 1)
    }

    /// Finds a filesystem type by name.
    pub fn getfs(&self, name: &[u8]) -> Option<usize> {
        self.list
            .lock()
            .iter()
            .position(|f| f.name.as_bytes() == name)
    }

    pub fn get(&self, idx: usize) -> FsType {
        self.list.lock()[idx]
    }
}

#[derive(Copy, Clone)]
struct VfsEntry {
    major: u32,
    minor: u32,
    fst: usize,
}

/// The mounted-device list: binds a (major, minor) pair to the filesystem
/// type it carries. `iget` consults it to bind dispatch tables to fresh
/// cache entries.
pub struct VfsList {
    list: SpinLock<ArrayVec<VfsEntry, NMINOR>>,
}

impl VfsList {
    pub fn new() -> Self {
        Self {
            list: SpinLock::new("vfsmlist", ArrayVec::new()),
        }
    }

    pub fn put(&self, major: u32, minor: u32, fst: usize) -> Result<(), KernelError> {
        let mut list = self.list.lock();
        if list.iter().any(|e| e.major == major && e.minor == minor) {
            return Err(KernelError::Busy);
        }
        list.try_push(VfsEntry { major, minor, fst })
            .map_err(|_| KernelError::Exhausted)
    }

    pub fn get(&self, major: u32, minor: u32) -> Option<usize> {
        self.list
            .lock()
            .iter()
            .find(|e| e.major == major && e.minor == minor)
            .map(|e| e.fst)
    }

    pub fn remove(&self, major: u32, minor: u32) {
        let mut list = self.list.lock();
        if let Some(pos) = list
            .iter()
            .position(|e| e.major == major && e.minor == minor)
        {
            let _ = list.swap_remove(pos);
        }
    }
}

/// A file-system transaction.
///
/// Brackets one system call's disk updates with `begin_op`/`end_op` on
/// every active native log, so a crash leaves each call all-or-nothing.
/// Dropping the transaction ends it; the last outstanding transaction
/// commits.
pub struct Tx<'s> {
    k: &'s Kernel,
    logs: ArrayVec<(u32, Arc<SleepableLock<Log>>), NMINOR>,
    owned: bool,
}

impl<'s> Tx<'s> {
    pub(crate) fn begin(k: &'s Kernel) -> Tx<'s> {
        let logs = k.sb().active_s5_logs();
        for (_, log) in &logs {
            Log::begin_op(log);
        }
        Tx {
            k,
            logs,
            owned: true,
        }
    }

    /// A handle onto a transaction the caller has already entered.
    /// Dropping it does not end the operation.
    pub(crate) fn assume_active(k: &'s Kernel) -> Tx<'s> {
        Tx {
            k,
            logs: k.sb().active_s5_logs(),
            owned: false,
        }
    }

    /// Caller has modified `b`'s data and is done with the buffer: hand it
    /// to the device's log. Replaces `bwrite`; the commit will do the disk
    /// write.
    pub fn write(&self, b: Buf<'_>) {
        let log = self
            .logs
            .iter()
            .find(|(dev, _)| *dev == b.dev())
            .map(|(_, log)| log)
            .expect("log_write: no log for device");
        log.lock().write(self.k, b);
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.owned {
            for (_, log) in self.logs.iter().rev() {
                Log::end_op(log, self.k);
            }
        }
    }
}
