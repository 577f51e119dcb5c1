//! The kernel object: owner of every file-system table.
//!
//! A `Kernel` is built over a block-device driver, installs the root
//! filesystem, and hands out `Proc` handles for callers to make system
//! calls through. There is no global instance; tests boot several kernels
//! over the same disk image to exercise crash recovery.

use array_macro::array;
use std::sync::Arc;

use crate::{
    bdev::{BdevTable, BlockDevice},
    bio::{Bcache, Buf},
    error::KernelError,
    file::{Devsw, FTable},
    fs::{ext2::EXT2FS, s5::S5FS, FsType, Itable, MountTable, SbTable, Tx, VfsList, VfsOps, Vfssw},
    lock::SpinLock,
    param::{IDEMAJOR, NDEV, ROOTDEV, ROOTFSTYPE},
    proc::Proc,
};

pub struct Kernel {
    bcache: Bcache,
    bdevs: BdevTable,
    devsw: SpinLock<[Devsw; NDEV]>,
    vfssw: Vfssw,
    vfslist: VfsList,
    mtable: MountTable,
    itable: Itable,
    ftable: FTable,
    sb: SbTable,

    /// Serializes block transfers: requests reach the device one at a
    /// time, in arrival order, like the driver's request queue.
    idelock: SpinLock<()>,
}

impl Kernel {
    /// Boots a kernel over `driver`: registers the filesystem types,
    /// opens the root device and installs the root filesystem (replaying
    /// its log when a previous life crashed mid-commit).
    pub fn new(driver: Arc<dyn BlockDevice>) -> Result<Kernel, KernelError> {
        let k = Kernel {
            bcache: Bcache::new(),
            bdevs: BdevTable::new(),
            devsw: SpinLock::new("devsw", array![_ => Devsw::default(); NDEV]),
            vfssw: Vfssw::new(),
            vfslist: VfsList::new(),
            mtable: MountTable::new(),
            itable: Itable::new(),
            ftable: FTable::new(),
            sb: SbTable::new(),
            idelock: SpinLock::new("ide", ()),
        };

        let _ = k.vfssw.register(FsType {
            name: "s5",
            ops: &S5FS,
            iops: &S5FS,
        })?;
        let _ = k.vfssw.register(FsType {
            name: "ext2",
            ops: &EXT2FS,
            iops: &EXT2FS,
        })?;
        S5FS.fs_init(&k)?;
        EXT2FS.fs_init(&k)?;

        k.bdevs.register(IDEMAJOR, driver)?;
        k.bdevs.open(IDEMAJOR, ROOTDEV)?;

        // Install the root filesystem.
        let root_fst = k
            .vfssw
            .getfs(ROOTFSTYPE.as_bytes())
            .expect("root filesystem type not registered");
        k.vfslist.put(IDEMAJOR, ROOTDEV, root_fst)?;
        k.fstype(root_fst).ops.readsb(&k, ROOTDEV);

        Ok(k)
    }

    /// A fresh process context whose working directory is the root.
    pub fn proc(&self) -> Proc {
        let fst = self
            .vfslist
            .get(IDEMAJOR, ROOTDEV)
            .expect("no root filesystem");
        let root = self.fstype(fst).ops.getroot(self, IDEMAJOR, ROOTDEV);
        Proc::new(root)
    }

    /// Registers character-device functions under `major`.
    pub fn set_devsw(&self, major: u16, dev: Devsw) -> Result<(), KernelError> {
        let mut devsw = self.devsw.lock();
        let slot = devsw
            .get_mut(major as usize)
            .ok_or(KernelError::InvalidArgument)?;
        *slot = dev;
        Ok(())
    }

    pub fn devsw(&self, major: u16) -> Option<Devsw> {
        self.devsw.lock().get(major as usize).copied()
    }

    /// Starts a file-system transaction; every mutating call brackets
    /// itself in one.
    pub fn begin_tx(&self) -> Tx<'_> {
        Tx::begin(self)
    }

    /// Returns a BUSY buffer with the contents of the indicated block.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let (mut b, valid) = self.bcache.bget(dev, blockno);
        if !valid {
            self.disk_rw(&mut b, false);
        }
        b
    }

    /// Writes the buffer's contents to disk synchronously. The buffer is
    /// VALID and clean when this returns.
    pub fn bwrite(&self, b: &mut Buf<'_>) {
        b.mark_dirty();
        self.disk_rw(b, true);
    }

    pub(crate) fn bget(&self, dev: u32, blockno: u32) -> (Buf<'_>, bool) {
        self.bcache.bget(dev, blockno)
    }

    /// Hands the buffer to the block device and completes it: VALID set,
    /// DIRTY cleared.
    fn disk_rw(&self, b: &mut Buf<'_>, write: bool) {
        let driver = self.bdevs.get(IDEMAJOR).expect("no block device driver");
        let bs = self.blocksize(b.dev());
        {
            let _queue = self.idelock.lock();
            driver.rw(b.dev(), b.blockno(), &mut b.data_mut()[..bs], write);
        }
        b.mark_written();
    }

    /// Logical block size of device `dev` (the mounted superblock's, or
    /// the native default).
    pub fn blocksize(&self, dev: u32) -> usize {
        self.sb.blocksize(dev)
    }

    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn bdevs(&self) -> &BdevTable {
        &self.bdevs
    }

    pub(crate) fn vfssw(&self) -> &Vfssw {
        &self.vfssw
    }

    pub(crate) fn vfslist(&self) -> &VfsList {
        &self.vfslist
    }

    /// Name of the filesystem type a device is registered to carry, if
    /// any.
    pub fn fsname(&self, major: u32, minor: u32) -> Option<&'static str> {
        self.vfslist.get(major, minor).map(|idx| self.fstype(idx).name)
    }

    /// The mount table.
    pub fn mtable(&self) -> &MountTable {
        &self.mtable
    }

    pub(crate) fn itable(&self) -> &Itable {
        &self.itable
    }

    pub(crate) fn ftable(&self) -> &FTable {
        &self.ftable
    }

    pub(crate) fn sb(&self) -> &SbTable {
        &self.sb
    }

    /// The registered filesystem type at `idx` in the switch table.
    pub(crate) fn fstype(&self, idx: usize) -> FsType {
        self.vfssw.get(idx)
    }
}
