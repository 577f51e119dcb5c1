//! The native (s5) filesystem. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /usr/rtm/notes.txt for convenient naming.
//!
//! This module contains the low-level file system manipulation routines.
//! The (higher-level) system call implementations are in sysfile.rs.
//!
//! Every operation that modifies the disk must run inside a transaction;
//! blocks are handed to the log, never written in place.

use core::{cmp, mem};

use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::KernelError,
    fs::{InodeType, MountEntry, RcInode, SbInfo, Tx, VfsOps, DIRSIZ},
    kernel::Kernel,
    lock::SleepableLock,
    param::{BSIZE, IDEMAJOR},
};

mod inode;
mod log;
mod superblock;

pub use inode::{Dinode, S5Priv};
pub use log::Log;
pub use superblock::{RawSuperblock, S5SbInfo, BPB, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO};

pub struct S5Fs;

/// The native filesystem type; registered under the name "s5".
pub static S5FS: S5Fs = S5Fs;

impl S5Fs {
    /// Copies the parsed superblock of `dev` out of the superblock table.
    pub(super) fn sb(k: &Kernel, dev: u32) -> RawSuperblock {
        k.sb().with(dev, |sb| match &sb.info {
            SbInfo::S5(info) => info.sb,
            _ => panic!("s5: device {} has no s5 superblock", dev),
        })
    }
}

impl VfsOps for S5Fs {
    fn mount(&self, k: &Kernel, major: u32, minor: u32, mp: &RcInode) -> Result<(), KernelError> {
        // The disk is already mounted.
        if k.mtable().mountpoint_of(minor).is_some() {
            return Err(KernelError::Busy);
        }

        // Read the superblock; this also builds the log and replays any
        // committed transaction a crash left behind.
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
                // Mounting over an existing mount point reuses its slot;
                // drop the references the displaced entry held.
                old.root_ip.free(k);
                old.mp_ip.free(k);
                Ok(())
            }
            Err(entry) => {
                // The disk is already mounted.
                entry.root_ip.free(k);
                entry.mp_ip.free(k);
                k.sb().unload(minor);
                Err(KernelError::Busy)
            }
        }
    }

    fn unmount(&self, k: &Kernel, minor: u32) -> Result<(), KernelError> {
        // Refuse while anything on the device is still referenced: an
        // inode other than the root, or the root held beyond the mount
        // table's own reference.
        if k.itable().busy_on_dev(minor, ROOTINO) {
            return Err(KernelError::Busy);
        }

        // From here on `iget` must not redirect through the mount point
        // anymore, so clear the flag before dismantling the entry.
        let (mpdev, mpinum) = k.mtable().mountpoint_of(minor).ok_or(KernelError::NotFound)?;
        let mp = k.itable().get_raw(k, mpdev, mpinum);
        {
            let mut guard = mp.lock(k);
            guard.typ = InodeType::Dir;
        }
        mp.set_mounted(k, false);
        mp.free(k);

        let entry = k.mtable().remove(minor).ok_or(KernelError::NotFound)?;
        entry.root_ip.free(k);
        entry.mp_ip.free(k);

        k.sb().unload(minor);
        k.bcache().invalidate(minor);
        ::log::info!("s5: unmounted dev {}", minor);
        Ok(())
    }

    fn getroot(&self, k: &Kernel, _major: u32, minor: u32) -> RcInode {
        k.itable().get(k, minor, ROOTINO)
    }

    fn readsb(&self, k: &Kernel, minor: u32) {
        let bp = k.bread(minor, 1);
        let raw = RawSuperblock::read_from(&bp.data()[..mem::size_of::<RawSuperblock>()]).unwrap();
        drop(bp);
        ::log::info!(
            "sb: size {} nblocks {} ninodes {} nlog {} logstart {} inodestart {} bmapstart {}",
            raw.size,
            raw.nblocks,
            raw.ninodes,
            raw.nlog,
            raw.logstart,
            raw.inodestart,
            raw.bmapstart
        );

        let log = Log::new(k, minor, raw.logstart, raw.nlog);
        k.sb().with_mut(minor, |sb| {
            sb.major = IDEMAJOR;
            sb.minor = minor;
            sb.blocksize = BSIZE;
            sb.loaded = true;
            sb.info = SbInfo::S5(S5SbInfo {
                sb: raw,
                log: Arc::new(SleepableLock::new("log", log)),
            });
        });
    }

    /// Allocate an inode on device `dev`, marking it allocated on disk by
    /// giving it type `typ`. A free inode has a type of zero.
    fn ialloc(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, typ: InodeType) -> RcInode {
        let sb = Self::sb(k, dev);
        let dinode_size = mem::size_of::<Dinode>();
        for inum in 1..sb.ninodes {
            let mut bp = k.bread(dev, sb.iblock(inum));
            let off = (inum as usize % IPB) * dinode_size;
            let dip = Dinode::read_from(&bp.data()[off..off + dinode_size]).unwrap();
            if dip.typ == 0 {
                // A free inode.
                let mut dip = Dinode::new_zeroed();
                dip.typ = typ.tag();
                if let InodeType::Device { major, minor } = typ {
                    dip.major = major as i16;
                    dip.minor = minor as i16;
                }
                bp.data_mut()[off..off + dinode_size].copy_from_slice(dip.as_bytes());
                // Mark it allocated on the disk.
                tx.write(bp);
                return k.itable().get(k, dev, inum);
            }
            drop(bp);
        }
        panic!("ialloc: no inodes");
    }

    /// Allocate a zeroed disk block.
    fn balloc(&self, k: &Kernel, tx: &Tx<'_>, dev: u32) -> u32 {
        let sb = Self::sb(k, dev);
        for b in num_iter::range_step(0, sb.size, BPB) {
            let mut bp = k.bread(dev, sb.bblock(b));
            for bi in 0..cmp::min(BPB, sb.size - b) {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    // Is block free?
                    bp.data_mut()[(bi / 8) as usize] |= m; // Mark block in use.
                    tx.write(bp);
                    self.bzero(k, tx, dev, b + bi);
                    return b + bi;
                }
            }
            drop(bp);
        }
        panic!("balloc: out of blocks");
    }

    /// Zero a block.
    fn bzero(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, bno: u32) {
        let (mut bp, _) = k.bget(dev, bno);
        bp.data_mut()[..BSIZE].iter_mut().for_each(|b| *b = 0);
        bp.mark_written();
        tx.write(bp);
    }

    /// Free a disk block.
    fn bfree(&self, k: &Kernel, tx: &Tx<'_>, dev: u32, b: u32) {
        let sb = Self::sb(k, dev);
        let mut bp = k.bread(dev, sb.bblock(b));
        let bi = (b % BPB) as usize;
        let m = 1u8 << (bi % 8);
        assert_ne!(bp.data()[bi / 8] & m, 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        tx.write(bp);
    }

    fn namecmp(&self, a: &[u8], b: &[u8]) -> bool {
        a.iter().take(DIRSIZ).eq(b.iter().take(DIRSIZ))
    }

    fn rootino(&self) -> u32 {
        ROOTINO
    }
}
