//! ext2 inodes: fetch, block mapping and directory scans.
//!
//! To store the locations of file data, ext2 uses a structure common to
//! UNIX filesystems: a tree of pointers anchored in the inode, with data
//! blocks at the leaves and indirect blocks in intermediate nodes. The
//! block mapper translates a logical block number into a path in that
//! tree, walks it through the buffer cache, and re-verifies the chain of
//! pointers before trusting the result.

use core::convert::TryInto;
use core::mem;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use super::{Ext2Fs, EXT2_NAME_LEN, EXT2_ROOT_INO};
use crate::{
    bio::Buf,
    error::KernelError,
    fs::{DirEnt, IPriv, Inode, InodeGuard, InodeInner, InodeOps, InodeType, RcInode, Tx, VfsOps},
    kernel::Kernel,
};

const EXT2_NDIR_BLOCKS: usize = 12;
const EXT2_IND_BLOCK: usize = 12;
const EXT2_DIND_BLOCK: usize = 13;
const EXT2_TIND_BLOCK: usize = 14;
pub const EXT2_N_BLOCKS: usize = 15;

/// Attempts before concluding the indirect chain is being rewritten under
/// us.
const EXT2_BMAP_RETRIES: usize = 4;

const S_IFMT: u16 = 0xF000;
const S_IFCHR: u16 = 0x2000;
const S_IFDIR: u16 = 0x4000;
const S_IFBLK: u16 = 0x6000;
const S_IFREG: u16 = 0x8000;

/// The on-disk ext2 inode (the 128-byte prefix shared by every revision).
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
pub struct RawExt2Inode {
    /// File mode
    pub i_mode: u16,
    /// Low 16 bits of owner uid
    pub i_uid: u16,
    /// Size in bytes
    pub i_size: u32,
    /// Access time
    pub i_atime: u32,
    /// Creation time
    pub i_ctime: u32,
    /// Modification time
    pub i_mtime: u32,
    /// Deletion time
    pub i_dtime: u32,
    /// Low 16 bits of group id
    pub i_gid: u16,
    /// Links count
    pub i_links_count: u16,
    /// Blocks count (512-byte units)
    pub i_blocks: u32,
    /// File flags
    pub i_flags: u32,
    pub i_osd1: u32,
    /// Pointers to blocks
    pub i_block: [u32; EXT2_N_BLOCKS],
    /// File version (for NFS)
    pub i_generation: u32,
    /// File ACL
    pub i_file_acl: u32,
    /// Directory ACL / high size bits
    pub i_dir_acl: u32,
    /// Fragment address
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

/// The in-memory half the ext2 backend keeps per inode: the raw record.
pub struct Ext2Priv {
    pub d: RawExt2Inode,
}

/// Header of an on-disk directory entry; `name_len` name bytes follow,
/// padded out to `rec_len`. Entries never cross a block boundary.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
struct Ext2DirentHeader {
    inode: u32,
    rec_len: u16,
    name_len: u8,
    file_type: u8,
}

const DIRENT_HEADER_SIZE: usize = mem::size_of::<Ext2DirentHeader>();

fn raw(inner: &InodeInner) -> &RawExt2Inode {
    match &inner.ip {
        IPriv::Ext2(p) => &p.d,
        _ => panic!("ext2: foreign inode"),
    }
}

/// Parse a logical block number into per-level offsets within the pointer
/// tree. Returns the offsets and the depth of the path (1 for a direct
/// block).
pub(super) fn block_to_path(mut i_block: u32, ptrs: u32, ptrs_bits: u32) -> ([u32; 4], usize) {
    let direct_blocks = EXT2_NDIR_BLOCKS as u32;
    let double_blocks = 1u32 << (ptrs_bits * 2);
    let mut offsets = [0u32; 4];

    if i_block < direct_blocks {
        offsets[0] = i_block;
        return (offsets, 1);
    }
    i_block -= direct_blocks;
    if i_block < ptrs {
        offsets[0] = EXT2_IND_BLOCK as u32;
        offsets[1] = i_block;
        return (offsets, 2);
    }
    i_block -= ptrs;
    if i_block < double_blocks {
        offsets[0] = EXT2_DIND_BLOCK as u32;
        offsets[1] = i_block >> ptrs_bits;
        offsets[2] = i_block & (ptrs - 1);
        return (offsets, 3);
    }
    i_block -= double_blocks;
    if (i_block >> (ptrs_bits * 2)) < ptrs {
        offsets[0] = EXT2_TIND_BLOCK as u32;
        offsets[1] = i_block >> (ptrs_bits * 2);
        offsets[2] = (i_block >> ptrs_bits) & (ptrs - 1);
        offsets[3] = i_block & (ptrs - 1);
        return (offsets, 4);
    }
    panic!("ext2: block is out of bounds");
}

/// One level of the indirect chain: the pointer value read, and where it
/// was read from (`buf` is `None` for the level anchored in the inode).
struct Indirect<'a> {
    key: u32,
    off: usize,
    buf: Option<Buf<'a>>,
}

fn block_u32(bp: &Buf<'_>, idx: usize) -> u32 {
    u32::from_le_bytes(bp.data()[idx * 4..idx * 4 + 4].try_into().unwrap())
}

/// Re-checks every pointer of the chain against the place it was read
/// from, to detect a chain rewritten while it was being walked.
fn verify_chain(i_block: &[u32; EXT2_N_BLOCKS], chain: &[Indirect<'_>]) -> bool {
    for ind in chain {
        let current = match &ind.buf {
            None => i_block[ind.off],
            Some(bp) => block_u32(bp, ind.off),
        };
        if current != ind.key {
            return false;
        }
    }
    true
}

impl Ext2Fs {
    /// Reads the raw inode record `ino` from its block group's inode
    /// table.
    fn raw_inode(k: &Kernel, dev: u32, ino: u32) -> RawExt2Inode {
        let (first_ino, inodes_count, inodes_per_group, inode_size, itable_block) =
            Self::sbi(k, dev, |sbi| {
                let group = (ino - 1) / sbi.s_inodes_per_group;
                (
                    sbi.s_first_ino,
                    sbi.s_inodes_count,
                    sbi.s_inodes_per_group,
                    sbi.s_inode_size,
                    sbi.group_desc(group).bg_inode_table,
                )
            });
        if (ino != EXT2_ROOT_INO && ino < first_ino) || ino > inodes_count {
            panic!("ext2: invalid inode number");
        }

        let bs = k.blocksize(dev) as u32;
        // Offset within the block group's inode table.
        let offset = ((ino - 1) % inodes_per_group) * inode_size;
        let block = itable_block + offset / bs;
        let bp = k.bread(dev, block);
        let off = (offset % bs) as usize;
        RawExt2Inode::read_from(&bp.data()[off..off + mem::size_of::<RawExt2Inode>()]).unwrap()
    }
}

impl InodeOps for Ext2Fs {
    fn fill(&self, k: &Kernel, ip: &Inode, inner: &mut InodeInner) {
        let d = Self::raw_inode(k, ip.dev(), ip.inum());

        // Translate the ext2 mode to the VFS type tags.
        inner.typ = match d.i_mode & S_IFMT {
            S_IFDIR => InodeType::Dir,
            S_IFREG => InodeType::File,
            S_IFCHR | S_IFBLK => {
                // Old-style encoding keeps the device numbers in the first
                // block pointer.
                let dev = d.i_block[0];
                InodeType::Device {
                    major: ((dev >> 8) & 0xff) as u16,
                    minor: (dev & 0xff) as u16,
                }
            }
            _ => panic!("ext2: invalid file mode"),
        };
        inner.nlink = d.i_links_count as i16;
        inner.size = d.i_size;
        inner.ip = IPriv::Ext2(Ext2Priv { d });
    }

    fn iupdate(&self, _k: &Kernel, _tx: &Tx<'_>, _ip: &InodeGuard<'_>) {
        panic!("ext2 iupdate op not defined");
    }

    fn itrunc(&self, _k: &Kernel, _tx: &Tx<'_>, _ip: &mut InodeGuard<'_>) {
        panic!("ext2 itrunc op not defined");
    }

    /// Walk the chain of indirect blocks leading to logical block `bn` and
    /// return the data block number, or 0 for a hole.
    fn bmap(&self, k: &Kernel, ip: &mut InodeGuard<'_>, bn: u32) -> u32 {
        let dev = ip.dev();
        let (ptrs, ptrs_bits) =
            Ext2Fs::sbi(k, dev, |sbi| (sbi.s_addr_per_block, sbi.s_addr_per_block_bits));
        let (offsets, depth) = block_to_path(bn, ptrs, ptrs_bits);
        let i_block = raw(ip).i_block;

        'retry: for _ in 0..EXT2_BMAP_RETRIES {
            let mut chain: ArrayVec<Indirect<'_>, 4> = ArrayVec::new();
            chain.push(Indirect {
                key: i_block[offsets[0] as usize],
                off: offsets[0] as usize,
                buf: None,
            });
            if chain[0].key == 0 {
                // Absent block.
                return 0;
            }

            for level in 1..depth {
                let bp = k.bread(dev, chain[level - 1].key);
                let off = offsets[level] as usize;
                let key = block_u32(&bp, off);
                chain.push(Indirect {
                    key,
                    off,
                    buf: Some(bp),
                });
                if !verify_chain(&i_block, &chain) {
                    // The chain changed while being read; drop the buffers
                    // in reverse order and start over.
                    while let Some(mut ind) = chain.pop() {
                        let _ = ind.buf.take();
                    }
                    continue 'retry;
                }
                if key == 0 {
                    while let Some(mut ind) = chain.pop() {
                        let _ = ind.buf.take();
                    }
                    return 0;
                }
            }

            let blkn = chain[depth - 1].key;
            while let Some(mut ind) = chain.pop() {
                let _ = ind.buf.take();
            }
            return blkn;
        }
        panic!("ext2: indirect chain keeps changing");
    }

    fn bmap_alloc(&self, _k: &Kernel, _tx: &Tx<'_>, _ip: &mut InodeGuard<'_>, _bn: u32) -> u32 {
        panic!("ext2 block allocation not defined");
    }

    fn writei(
        &self,
        _k: &Kernel,
        _tx: &Tx<'_>,
        _ip: &mut InodeGuard<'_>,
        _src: &[u8],
        _off: u32,
    ) -> Result<usize, KernelError> {
        panic!("ext2 writei op not defined");
    }

    /// Scan the variable-length directory records for `name`. Entries
    /// never straddle a block boundary, so the walk goes block by block.
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

        let dev = dp.dev();
        let bs = k.blocksize(dev) as u32;
        let namelen = name.len();

        let mut off: u32 = 0;
        while off < dp.size {
            let currblk = off / bs;
            let bn = self.bmap(k, dp, currblk);
            assert_ne!(bn, 0, "ext2: hole in directory");
            let bp = k.bread(dev, bn);

            let boff = (off % bs) as usize;
            let hd = Ext2DirentHeader::read_from(&bp.data()[boff..boff + DIRENT_HEADER_SIZE])
                .unwrap();
            assert!(
                hd.rec_len as usize >= DIRENT_HEADER_SIZE && boff + hd.rec_len as usize <= bs as usize,
                "ext2: corrupt directory entry"
            );

            if hd.inode == 0 || hd.name_len as usize != namelen {
                off += hd.rec_len as u32;
                continue;
            }

            let ename = &bp.data()[boff + DIRENT_HEADER_SIZE..boff + DIRENT_HEADER_SIZE + hd.name_len as usize];
            if self.namecmp(name, ename) {
                // Entry matches path element.
                let inum = hd.inode;
                drop(bp);
                return Ok((k.itable().get(k, dev, inum), off));
            }
            off += hd.rec_len as u32;
        }

        Err(KernelError::NotFound)
    }

    fn dirlink(
        &self,
        _k: &Kernel,
        _tx: &Tx<'_>,
        _dp: &mut InodeGuard<'_>,
        _name: &[u8],
        _inum: u32,
    ) -> Result<(), KernelError> {
        panic!("ext2 dirlink op not defined");
    }

    fn unlink(
        &self,
        _k: &Kernel,
        _tx: &Tx<'_>,
        _dp: &mut InodeGuard<'_>,
        _off: u32,
    ) -> Result<(), KernelError> {
        panic!("ext2 unlink op not defined");
    }

    fn isdirempty(&self, k: &Kernel, dp: &mut InodeGuard<'_>) -> bool {
        let mut off = 0;
        while let Some(entry) = self.readdir(k, dp, off) {
            if entry.name.as_slice() != b"." && entry.name.as_slice() != b".." {
                return false;
            }
            off = entry.off;
        }
        true
    }

    fn readdir(&self, k: &Kernel, dp: &mut InodeGuard<'_>, off: u32) -> Option<DirEnt> {
        let dev = dp.dev();
        let bs = k.blocksize(dev) as u32;

        let mut off = off;
        while off < dp.size {
            let bn = self.bmap(k, dp, off / bs);
            assert_ne!(bn, 0, "ext2: hole in directory");
            let bp = k.bread(dev, bn);

            let boff = (off % bs) as usize;
            let hd = Ext2DirentHeader::read_from(&bp.data()[boff..boff + DIRENT_HEADER_SIZE])
                .unwrap();
            assert!(
                hd.rec_len as usize >= DIRENT_HEADER_SIZE && boff + hd.rec_len as usize <= bs as usize,
                "ext2: corrupt directory entry"
            );

            if hd.inode == 0 {
                off += hd.rec_len as u32;
                continue;
            }

            let mut name = ArrayVec::new();
            name.try_extend_from_slice(
                &bp.data()[boff + DIRENT_HEADER_SIZE
                    ..boff + DIRENT_HEADER_SIZE + hd.name_len.min(EXT2_NAME_LEN as u8) as usize],
            )
            .unwrap();
            return Some(DirEnt {
                inum: hd.inode,
                name,
                off: off + hd.rec_len as u32,
            });
        }
        None
    }
}
