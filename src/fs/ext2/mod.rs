//! The ext2 filesystem, read-oriented.
//!
//! Based on the Linux ext2 implementation. This release mounts standard
//! Rev-0/Rev-1 images read-only: superblock and group-descriptor parsing,
//! inode fetch, the full four-level block mapper and directory scans are
//! implemented; every write path faults fatally.

use crate::{
    error::KernelError,
    fs::{InodeType, MountEntry, RcInode, SbInfo, Tx, VfsOps},
    kernel::Kernel,
};

mod inode;
mod superblock;

pub use inode::{Ext2Priv, RawExt2Inode, EXT2_N_BLOCKS};
pub use superblock::{
    ext2_group_sparse, Ext2GroupDesc, Ext2SbInfo, RawExt2Superblock, EXT2_MAX_BGC,
    EXT2_MIN_BLKSIZE, EXT2_NAME_LEN, EXT2_ROOT_INO, EXT2_SUPER_MAGIC,
};

pub struct Ext2Fs;

/// The ext2 filesystem type; registered under the name "ext2".
pub static EXT2FS: Ext2Fs = Ext2Fs;

impl Ext2Fs {
    /// Runs `f` over the cooked superblock of `dev`.
    pub(super) fn sbi<R>(k: &Kernel, dev: u32, f: impl FnOnce(&Ext2SbInfo) -> R) -> R {
        k.sb().with(dev, |sb| match &sb.info {
            SbInfo::Ext2(info) => f(info),
            _ => panic!("ext2: device {} has no ext2 superblock", dev),
        })
    }
}

impl VfsOps for Ext2Fs {
    fn mount(&self, k: &Kernel, major: u32, minor: u32, mp: &RcInode) -> Result<(), KernelError> {
        // The disk is already mounted.
        if k.mtable().mountpoint_of(minor).is_some() {
            return Err(KernelError::Busy);
        }

        // Read the superblock.
        self.readsb(k, minor);

        // Fetch the mounted filesystem's root.
        let root = self.getroot(k, major, minor);
        let root_inum = root.inum(k);

        let entry = MountEntry {
            dev: minor,
            mp: (mp.dev(k), mp.inum(k)),
            root_inum,
            mp_ip: mp.dup(k),
            root_ip: root,
        };
        match k.mtable().insert(entry) {
            Ok(None) => Ok(()),
            Ok(Some(old)) => {
                old.root_ip.free(k);
                old.mp_ip.free(k);
                Ok(())
            }
            Err(entry) => {
                entry.root_ip.free(k);
                entry.mp_ip.free(k);
                k.sb().unload(minor);
                Err(KernelError::Busy)
            }
        }
    }

    fn unmount(&self, _k: &Kernel, _minor: u32) -> Result<(), KernelError> {
        panic!("ext2 unmount op not defined");
    }

    fn getroot(&self, k: &Kernel, _major: u32, minor: u32) -> RcInode {
        k.itable().get(k, minor, EXT2_ROOT_INO)
    }

    fn readsb(&self, k: &Kernel, minor: u32) {
        let (blocksize, sbi) = superblock::load(k, minor);
        log::info!(
            "ext2: dev {} blocksize {} inodes {} blocks {} groups {}",
            minor,
            blocksize,
            sbi.s_inodes_count,
            sbi.s_blocks_count,
            sbi.s_groups_count
        );
        k.sb().with_mut(minor, |sb| {
            sb.blocksize = blocksize;
            sb.loaded = true;
            sb.info = SbInfo::Ext2(sbi);
        });
    }

    fn ialloc(&self, _k: &Kernel, _tx: &Tx<'_>, _dev: u32, _typ: InodeType) -> RcInode {
        panic!("ext2 ialloc op not defined");
    }

    fn balloc(&self, _k: &Kernel, _tx: &Tx<'_>, _dev: u32) -> u32 {
        panic!("ext2 balloc op not defined");
    }

    fn bzero(&self, _k: &Kernel, _tx: &Tx<'_>, _dev: u32, _bno: u32) {
        panic!("ext2 bzero op not defined");
    }

    fn bfree(&self, _k: &Kernel, _tx: &Tx<'_>, _dev: u32, _b: u32) {
        panic!("ext2 bfree op not defined");
    }

    fn namecmp(&self, a: &[u8], b: &[u8]) -> bool {
        a.iter().take(EXT2_NAME_LEN).eq(b.iter().take(EXT2_NAME_LEN))
    }

    fn rootino(&self) -> u32 {
        EXT2_ROOT_INO
    }
}
