//! Test support: disk-image builders for both filesystems and a kernel
//! bootstrapper over memory-backed disks.

#![allow(dead_code)]

use std::convert::TryInto;
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use vfs6::fs::ext2::{Ext2GroupDesc, RawExt2Inode, RawExt2Superblock, EXT2_SUPER_MAGIC};
use vfs6::fs::s5::{Dinode, RawSuperblock, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO};
use vfs6::fs::Dirent;
use vfs6::{BlockDevice, Kernel, MemDisk, MemIde, BSIZE, LOGSIZE, ROOTDEV, T_DIR};

/// Size of the native test images, in blocks.
pub const FSSIZE: u32 = 1000;
const NINODES: u32 = 200;

/// Builds a native filesystem image the way mkfs lays one out:
/// [ boot | sb | log | inodes | bitmap | data ].
pub struct S5Image {
    img: Vec<u8>,
    sb: RawSuperblock,
    freeinode: u32,
    freeblock: u32,
}

impl S5Image {
    pub fn new() -> S5Image {
        let nlog = LOGSIZE as u32 + 1;
        let ninodeblocks = NINODES / IPB as u32 + 1;
        let nbitmap = FSSIZE / (BSIZE as u32 * 8) + 1;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;

        let sb = RawSuperblock {
            size: FSSIZE,
            nblocks: FSSIZE - nmeta,
            ninodes: NINODES,
            nlog,
            logstart: 2,
            inodestart: 2 + nlog,
            bmapstart: 2 + nlog + ninodeblocks,
        };

        let mut image = S5Image {
            img: vec![0; FSSIZE as usize * BSIZE],
            sb,
            freeinode: 1,
            freeblock: nmeta,
        };
        image.img[BSIZE..BSIZE + core::mem::size_of::<RawSuperblock>()]
            .copy_from_slice(sb.as_bytes());

        let root = image.ialloc(T_DIR);
        assert_eq!(root, ROOTINO);
        image.dirlink(root, b".", root);
        image.dirlink(root, b"..", root);
        image
    }

    pub fn ialloc(&mut self, typ: i16) -> u32 {
        let inum = self.freeinode;
        self.freeinode += 1;
        assert!(inum < NINODES, "mkfs: out of inodes");
        let mut din = Dinode::new_zeroed();
        din.typ = typ;
        din.nlink = 1;
        self.write_dinode(inum, &din);
        inum
    }

    pub fn balloc(&mut self) -> u32 {
        let b = self.freeblock;
        self.freeblock += 1;
        assert!(b < FSSIZE, "mkfs: out of blocks");
        b
    }

    fn dinode_off(&self, inum: u32) -> usize {
        self.sb.iblock(inum) as usize * BSIZE
            + (inum as usize % IPB) * core::mem::size_of::<Dinode>()
    }

    pub fn read_dinode(&self, inum: u32) -> Dinode {
        let off = self.dinode_off(inum);
        Dinode::read_from(&self.img[off..off + core::mem::size_of::<Dinode>()]).unwrap()
    }

    fn write_dinode(&mut self, inum: u32, din: &Dinode) {
        let off = self.dinode_off(inum);
        self.img[off..off + core::mem::size_of::<Dinode>()].copy_from_slice(din.as_bytes());
    }

    /// Appends `data` to the inode's content, growing direct blocks first
    /// and then the single indirect block.
    pub fn append(&mut self, inum: u32, data: &[u8]) {
        let mut din = self.read_dinode(inum);
        let mut off = din.size as usize;
        let mut done = 0;

        while done < data.len() {
            let fbn = off / BSIZE;
            assert!(fbn < MAXFILE, "mkfs: file too big");
            let bn = if fbn < NDIRECT {
                if din.addrs[fbn] == 0 {
                    din.addrs[fbn] = self.balloc();
                }
                din.addrs[fbn]
            } else {
                if din.addrs[NDIRECT] == 0 {
                    din.addrs[NDIRECT] = self.balloc();
                }
                let ind = din.addrs[NDIRECT] as usize * BSIZE;
                let idx = fbn - NDIRECT;
                assert!(idx < NINDIRECT);
                let entry_off = ind + idx * 4;
                let mut bn = u32::from_le_bytes(
                    self.img[entry_off..entry_off + 4].try_into().unwrap(),
                );
                if bn == 0 {
                    bn = self.balloc();
                    self.img[entry_off..entry_off + 4].copy_from_slice(&bn.to_le_bytes());
                }
                bn
            };

            let n = (data.len() - done).min((fbn + 1) * BSIZE - off);
            let dst = bn as usize * BSIZE + off % BSIZE;
            self.img[dst..dst + n].copy_from_slice(&data[done..done + n]);
            done += n;
            off += n;
        }

        din.size = off as u32;
        self.write_dinode(inum, &din);
    }

    pub fn dirlink(&mut self, dir: u32, name: &[u8], inum: u32) {
        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        self.append(dir, de.as_bytes());
    }

    /// Marks every block up to the allocation frontier used and returns
    /// the finished image.
    pub fn finish(mut self) -> Vec<u8> {
        let bmap = self.sb.bmapstart as usize * BSIZE;
        for b in 0..self.freeblock as usize {
            self.img[bmap + b / 8] |= 1 << (b % 8);
        }
        self.img
    }
}

/// Boots a kernel over a root image; returns the kernel, the root disk
/// handle (for snapshots) and the driver (for attaching more minors).
pub fn boot(img: Vec<u8>) -> (Kernel, Arc<MemDisk>, Arc<MemIde>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = MemDisk::new(img);
    let ide = MemIde::new();
    ide.attach(ROOTDEV, disk.clone());
    let driver: Arc<dyn BlockDevice> = ide.clone();
    let kernel = Kernel::new(driver).expect("boot");
    (kernel, disk, ide)
}

/// Boots a kernel over a fresh empty root filesystem.
pub fn boot_empty() -> (Kernel, Arc<MemDisk>, Arc<MemIde>) {
    boot(S5Image::new().finish())
}

// ---------------------------------------------------------------------
// ext2 images

const EXT2_INODE_SIZE: usize = 128;
const EXT2_ROOT: u32 = 2;
/// First inode number usable for files on the test images.
pub const EXT2_FIRST_FILE_INO: u32 = 11;

/// Builds a one-group ext2 image with block size `bs` containing:
///   /hello.txt  ("Hello\n")
///   /big        (13 logical blocks, block `i` filled with byte `i`)
///   /sub/       (an empty subdirectory)
pub fn ext2_image(bs: usize) -> Vec<u8> {
    assert!(bs == 1024 || bs == 2048, "unsupported test block size");
    let blocks_count: u32 = 64;
    let inodes_count: u32 = 16;
    let first_data_block: u32 = if bs == 1024 { 1 } else { 0 };
    let log_block_size: u32 = if bs == 1024 { 0 } else { 1 };

    // sb lives in block `first_data_block`; then descriptors, bitmaps,
    // inode table, then data.
    let gd_block = first_data_block + 1;
    let block_bitmap = gd_block + 1;
    let inode_bitmap = block_bitmap + 1;
    let inode_table = inode_bitmap + 1;
    let itable_blocks = (inodes_count as usize * EXT2_INODE_SIZE / bs) as u32;
    let mut next_block = inode_table + itable_blocks;

    let mut img = vec![0u8; blocks_count as usize * bs];

    let mut es = RawExt2Superblock::new_zeroed();
    es.s_inodes_count = inodes_count;
    es.s_blocks_count = blocks_count;
    es.s_first_data_block = first_data_block;
    es.s_log_block_size = log_block_size;
    es.s_blocks_per_group = 8192;
    es.s_inodes_per_group = inodes_count;
    es.s_magic = EXT2_SUPER_MAGIC;
    es.s_rev_level = 1;
    es.s_first_ino = EXT2_FIRST_FILE_INO;
    es.s_inode_size = EXT2_INODE_SIZE as u16;
    img[1024..1024 + 1024].copy_from_slice(es.as_bytes());

    let mut gd = Ext2GroupDesc::new_zeroed();
    gd.bg_block_bitmap = block_bitmap;
    gd.bg_inode_bitmap = inode_bitmap;
    gd.bg_inode_table = inode_table;
    img[gd_block as usize * bs..gd_block as usize * bs + 32].copy_from_slice(gd.as_bytes());

    let put_inode = |img: &mut Vec<u8>, ino: u32, d: &RawExt2Inode| {
        let off = inode_table as usize * bs + (ino as usize - 1) * EXT2_INODE_SIZE;
        img[off..off + EXT2_INODE_SIZE].copy_from_slice(d.as_bytes());
    };

    // Root directory.
    let root_block = next_block;
    next_block += 1;
    let mut root = RawExt2Inode::new_zeroed();
    root.i_mode = 0x4000 | 0o755;
    root.i_size = bs as u32;
    root.i_links_count = 3;
    root.i_block[0] = root_block;
    put_inode(&mut img, EXT2_ROOT, &root);

    // /hello.txt
    let hello_ino = EXT2_FIRST_FILE_INO + 1;
    let hello_block = next_block;
    next_block += 1;
    let mut hello = RawExt2Inode::new_zeroed();
    hello.i_mode = 0x8000 | 0o644;
    hello.i_size = 6;
    hello.i_links_count = 1;
    hello.i_block[0] = hello_block;
    put_inode(&mut img, hello_ino, &hello);
    img[hello_block as usize * bs..hello_block as usize * bs + 6].copy_from_slice(b"Hello\n");

    // /big: 13 logical blocks, the 13th through the single indirect.
    let big_ino = hello_ino + 1;
    let mut big = RawExt2Inode::new_zeroed();
    big.i_mode = 0x8000 | 0o644;
    big.i_size = 13 * bs as u32;
    big.i_links_count = 1;
    for i in 0..12 {
        let b = next_block;
        next_block += 1;
        big.i_block[i] = b;
        img[b as usize * bs..(b + 1) as usize * bs]
            .iter_mut()
            .for_each(|x| *x = i as u8);
    }
    let ind_block = next_block;
    next_block += 1;
    big.i_block[12] = ind_block;
    let last_block = next_block;
    next_block += 1;
    img[ind_block as usize * bs..ind_block as usize * bs + 4]
        .copy_from_slice(&last_block.to_le_bytes());
    img[last_block as usize * bs..(last_block + 1) as usize * bs]
        .iter_mut()
        .for_each(|x| *x = 12u8);
    put_inode(&mut img, big_ino, &big);

    // /sub
    let sub_ino = big_ino + 1;
    let sub_block = next_block;
    let mut sub = RawExt2Inode::new_zeroed();
    sub.i_mode = 0x4000 | 0o755;
    sub.i_size = bs as u32;
    sub.i_links_count = 2;
    sub.i_block[0] = sub_block;
    put_inode(&mut img, sub_ino, &sub);

    // Directory contents. Entries are padded to 4 bytes and the last one
    // stretches to the end of the block.
    let mut dir = Ext2DirBuilder::new(bs);
    dir.entry(EXT2_ROOT, 2, b".");
    dir.entry(EXT2_ROOT, 2, b"..");
    dir.entry(hello_ino, 1, b"hello.txt");
    dir.entry(big_ino, 1, b"big");
    dir.entry(sub_ino, 2, b"sub");
    let bytes = dir.finish();
    img[root_block as usize * bs..root_block as usize * bs + bs].copy_from_slice(&bytes);

    let mut dir = Ext2DirBuilder::new(bs);
    dir.entry(sub_ino, 2, b".");
    dir.entry(EXT2_ROOT, 2, b"..");
    let bytes = dir.finish();
    img[sub_block as usize * bs..sub_block as usize * bs + bs].copy_from_slice(&bytes);

    img
}

struct Ext2DirBuilder {
    bs: usize,
    buf: Vec<u8>,
    last_rec: usize,
}

impl Ext2DirBuilder {
    fn new(bs: usize) -> Self {
        Self {
            bs,
            buf: Vec::new(),
            last_rec: 0,
        }
    }

    fn entry(&mut self, inode: u32, file_type: u8, name: &[u8]) {
        let rec_len = (8 + name.len() + 3) & !3;
        self.last_rec = self.buf.len();
        self.buf.extend_from_slice(&inode.to_le_bytes());
        self.buf.extend_from_slice(&(rec_len as u16).to_le_bytes());
        self.buf.push(name.len() as u8);
        self.buf.push(file_type);
        self.buf.extend_from_slice(name);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    /// Pads the final entry's rec_len out to the block boundary.
    fn finish(mut self) -> Vec<u8> {
        assert!(!self.buf.is_empty() && self.buf.len() <= self.bs);
        let stretch = (self.bs - self.last_rec) as u16;
        self.buf[self.last_rec + 4..self.last_rec + 6].copy_from_slice(&stretch.to_le_bytes());
        self.buf.resize(self.bs, 0);
        self.buf
    }
}
