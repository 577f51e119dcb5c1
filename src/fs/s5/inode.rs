//! Native inodes.
//!
//! The inode disk structure holds metadata: the file's type, its size, the
//! number of links referring to it, and the list of blocks holding the
//! file's content. Inodes are laid out sequentially on disk at
//! `sb.inodestart`; each inode has a number indicating its position.
//!
//! The content associated with each inode is stored in blocks on the
//! disk. The first NDIRECT block numbers are listed in `addrs`; the next
//! NINDIRECT blocks are listed in the single indirect block `addrs[NDIRECT]`.

use core::mem;

use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::{S5Fs, IPB, MAXFILE, NDIRECT, NINDIRECT};
use crate::{
    error::KernelError,
    fs::{
        Dirent, IPriv, Inode, InodeGuard, InodeInner, InodeOps, InodeType, RcInode, Tx, VfsOps,
        DIRENT_SIZE,
    },
    kernel::Kernel,
    param::BSIZE,
    stat::{T_DEV, T_DIR, T_FILE, T_MOUNT},
};

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
pub struct Dinode {
    /// File type; zero marks a free inode
    pub typ: i16,

    /// Major device number (device files only)
    pub major: i16,

    /// Minor device number (device files only)
    pub minor: i16,

    /// Number of links to inode in file system
    pub nlink: i16,

    /// Size of file (bytes)
    pub size: u32,

    /// Direct block addresses, then the single indirect block
    pub addrs: [u32; NDIRECT + 1],
}

const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// The in-memory half the native backend keeps per inode: a copy of the
/// disk block addresses.
pub struct S5Priv {
    pub addrs: [u32; NDIRECT + 1],
}

fn addrs(inner: &InodeInner) -> &[u32; NDIRECT + 1] {
    match &inner.ip {
        IPriv::S5(p) => &p.addrs,
        _ => panic!("s5: foreign inode"),
    }
}

fn addrs_mut(inner: &mut InodeInner) -> &mut [u32; NDIRECT + 1] {
    match &mut inner.ip {
        IPriv::S5(p) => &mut p.addrs,
        _ => panic!("s5: foreign inode"),
    }
}

impl S5Fs {
    /// Reads the on-disk copy of `(dev, inum)`.
    fn dinode(k: &Kernel, dev: u32, inum: u32) -> Dinode {
        let sb = Self::sb(k, dev);
        let bp = k.bread(dev, sb.iblock(inum));
        let off = (inum as usize % IPB) * DINODE_SIZE;
        Dinode::read_from(&bp.data()[off..off + DINODE_SIZE]).unwrap()
    }

    fn bmap_internal(
        &self,
        k: &Kernel,
        tx: Option<&Tx<'_>>,
        ip: &mut InodeGuard<'_>,
        bn: u32,
    ) -> u32 {
        let dev = ip.dev();
        let bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = addrs(ip)[bn];
            if addr == 0 {
                let tx = match tx {
                    Some(tx) => tx,
                    None => return 0,
                };
                addr = self.balloc(k, tx, dev);
                addrs_mut(ip)[bn] = addr;
            }
            return addr;
        }
        let bn = bn - NDIRECT;
        assert!(bn < NINDIRECT, "bmap: out of range");

        // Load the indirect block, allocating if necessary.
        let mut indirect = addrs(ip)[NDIRECT];
        if indirect == 0 {
            let tx = match tx {
                Some(tx) => tx,
                None => return 0,
            };
            indirect = self.balloc(k, tx, dev);
            addrs_mut(ip)[NDIRECT] = indirect;
        }

        let mut bp = k.bread(dev, indirect);
        let mut entries = LayoutVerified::<&mut [u8], [u32]>::new_slice(
            &mut bp.data_mut()[..BSIZE],
        )
        .expect("bmap: unaligned block");
        let addr = entries[bn];
        if addr != 0 {
            return addr;
        }
        match tx {
            None => 0,
            Some(tx) => {
                let addr = self.balloc(k, tx, dev);
                entries[bn] = addr;
                drop(entries);
                tx.write(bp);
                addr
            }
        }
    }
}

impl InodeOps for S5Fs {
    /// Reads the inode's disk image into the in-memory copy.
    fn fill(&self, k: &Kernel, ip: &Inode, inner: &mut InodeInner) {
        let dip = Self::dinode(k, ip.dev(), ip.inum());
        inner.typ = match dip.typ {
            0 => InodeType::None,
            T_DIR => InodeType::Dir,
            T_FILE => InodeType::File,
            T_DEV => InodeType::Device {
                major: dip.major as u16,
                minor: dip.minor as u16,
            },
            T_MOUNT => InodeType::Mount,
            _ => panic!("ilock: bad on-disk type"),
        };
        inner.nlink = dip.nlink;
        inner.size = dip.size;
        inner.ip = IPriv::S5(S5Priv { addrs: dip.addrs });
    }

    /// Copy a modified in-memory inode to disk. Must be called after every
    /// change to an inode field that lives on disk.
    fn iupdate(&self, k: &Kernel, tx: &Tx<'_>, ip: &InodeGuard<'_>) {
        let sb = Self::sb(k, ip.dev());
        let mut dip = Dinode::new_zeroed();
        dip.typ = ip.typ.tag();
        if let InodeType::Device { major, minor } = ip.typ {
            dip.major = major as i16;
            dip.minor = minor as i16;
        }
        dip.nlink = ip.nlink;
        dip.size = ip.size;
        dip.addrs = *addrs(ip);

        let mut bp = k.bread(ip.dev(), sb.iblock(ip.inum()));
        let off = (ip.inum() as usize % IPB) * DINODE_SIZE;
        bp.data_mut()[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
        tx.write(bp);
    }

    /// Truncate inode (discard contents). Called with the inode locked.
    fn itrunc(&self, k: &Kernel, tx: &Tx<'_>, ip: &mut InodeGuard<'_>) {
        let dev = ip.dev();
        for i in 0..NDIRECT {
            let addr = addrs(ip)[i];
            if addr != 0 {
                self.bfree(k, tx, dev, addr);
                addrs_mut(ip)[i] = 0;
            }
        }

        let indirect = addrs(ip)[NDIRECT];
        if indirect != 0 {
            {
                let bp = k.bread(dev, indirect);
                let entries =
                    LayoutVerified::<&[u8], [u32]>::new_slice(&bp.data()[..BSIZE])
                        .expect("itrunc: unaligned block");
                for a in entries.iter() {
                    if *a != 0 {
                        self.bfree(k, tx, dev, *a);
                    }
                }
            }
            self.bfree(k, tx, dev, indirect);
            addrs_mut(ip)[NDIRECT] = 0;
        }

        ip.size = 0;
        self.iupdate(k, tx, ip);
    }

    /// Return the disk block of the `bn`th block in the inode, or 0 when
    /// the file has no block there.
    fn bmap(&self, k: &Kernel, ip: &mut InodeGuard<'_>, bn: u32) -> u32 {
        self.bmap_internal(k, None, ip, bn)
    }

    /// Like `bmap`, allocating the block (and the indirect block) when
    /// missing.
    fn bmap_alloc(&self, k: &Kernel, tx: &Tx<'_>, ip: &mut InodeGuard<'_>, bn: u32) -> u32 {
        self.bmap_internal(k, Some(tx), ip, bn)
    }

    /// Write data to the inode. Writes must start at or inside the file
    /// and may grow it up to the maximum file size.
    fn writei(
        &self,
        k: &Kernel,
        tx: &Tx<'_>,
        ip: &mut InodeGuard<'_>,
        src: &[u8],
        off: u32,
    ) -> Result<usize, KernelError> {
        if let InodeType::Device { major, .. } = ip.typ {
            let write = k
                .devsw(major)
                .and_then(|d| d.write)
                .ok_or(KernelError::InvalidArgument)?;
            return write(k, src);
        }

        let n = src.len() as u32;
        if off > ip.size || off.wrapping_add(n) < off {
            return Err(KernelError::InvalidArgument);
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(KernelError::InvalidArgument);
        }

        let bs = BSIZE as u32;
        let mut tot: u32 = 0;
        while tot < n {
            let bn = self.bmap_alloc(k, tx, ip, (off + tot) / bs);
            let mut bp = k.bread(ip.dev(), bn);
            let m = (n - tot).min(bs - (off + tot) % bs);
            let begin = ((off + tot) % bs) as usize;
            bp.data_mut()[begin..begin + m as usize]
                .copy_from_slice(&src[tot as usize..(tot + m) as usize]);
            tx.write(bp);
            tot += m;
        }

        if n > 0 && off + n > ip.size {
            ip.size = off + n;
        }

        // Write the inode back even if the size didn't change, because the
        // loop above may have added blocks to `addrs`.
        self.iupdate(k, tx, ip);
        Ok(n as usize)
    }

    /// Look for a directory entry in a directory. If found, return the
    /// entry's inode and the byte offset of the entry.
    fn dirlookup(
        &self,
        k: &Kernel,
        dp: &mut InodeGuard<'_>,
        name: &[u8],
    ) -> Result<(RcInode, u32), KernelError> {
        assert!(
            matches!(dp.typ, InodeType::Dir | InodeType::Mount),
            "dirlookup not DIR"
        );

        let size = dp.size;
        let mut off = 0;
        while off < size {
            let mut bytes = [0u8; DIRENT_SIZE];
            let read = self.readi(k, dp, &mut bytes, off)?;
            assert_eq!(read, DIRENT_SIZE, "dirlookup read");
            let de = Dirent::read_from(&bytes[..]).unwrap();
            if de.inum != 0 && self.namecmp(name, de.name()) {
                // Entry matches path element.
                return Ok((k.itable().get(k, dp.dev(), de.inum as u32), off));
            }
            off += DIRENT_SIZE as u32;
        }

        Err(KernelError::NotFound)
    }

    /// Erase the directory entry at `off` by zeroing it.
    fn unlink(
        &self,
        k: &Kernel,
        tx: &Tx<'_>,
        dp: &mut InodeGuard<'_>,
        off: u32,
    ) -> Result<(), KernelError> {
        let de = Dirent::default();
        let written = self.writei(k, tx, dp, de.as_bytes(), off)?;
        assert_eq!(written, DIRENT_SIZE, "unlink: writei");
        Ok(())
    }

    /// Is the directory empty except for "." and ".." ?
    fn isdirempty(&self, k: &Kernel, dp: &mut InodeGuard<'_>) -> bool {
        let size = dp.size;
        let mut off = (2 * DIRENT_SIZE) as u32;
        while off < size {
            let mut bytes = [0u8; DIRENT_SIZE];
            let read = self.readi(k, dp, &mut bytes, off).expect("isdirempty: readi");
            assert_eq!(read, DIRENT_SIZE, "isdirempty: readi");
            let de = Dirent::read_from(&bytes[..]).unwrap();
            if de.inum != 0 {
                return false;
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}
