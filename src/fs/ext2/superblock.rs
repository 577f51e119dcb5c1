//! ext2 superblock and block-group descriptors.
//!
//! The superblock always starts at byte 1024 of the device, whatever the
//! logical block size turns out to be; it is parsed once at mount and the
//! interesting fields are cooked into `Ext2SbInfo` together with a copy of
//! the group-descriptor table. The layout definitions follow the Linux
//! ext2 implementation.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::{kernel::Kernel, param::IDEMAJOR, param::MAXBSIZE};

pub const EXT2_MIN_BLKSIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT2_ROOT_INO: u32 = 2;
pub const EXT2_NAME_LEN: usize = 255;

/// Cap on the number of group-descriptor blocks kept in memory.
pub const EXT2_MAX_BGC: usize = 8;

const EXT2_GOOD_OLD_REV: u32 = 0;
const EXT2_GOOD_OLD_INODE_SIZE: u32 = 128;
const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

pub const EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const EXT2_FEATURE_INCOMPAT_META_BG: u32 = 0x0010;

/// The ext2 superblock layout (Rev 0 and Rev 1), little-endian.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
pub struct RawExt2Superblock {
    /// Inodes count
    pub s_inodes_count: u32,
    /// Blocks count
    pub s_blocks_count: u32,
    /// Reserved blocks count
    pub s_r_blocks_count: u32,
    /// Free blocks count
    pub s_free_blocks_count: u32,
    /// Free inodes count
    pub s_free_inodes_count: u32,
    /// First data block
    pub s_first_data_block: u32,
    /// Block size is 1024 << this
    pub s_log_block_size: u32,
    /// Fragment size
    pub s_log_frag_size: u32,
    /// # Blocks per group
    pub s_blocks_per_group: u32,
    /// # Fragments per group
    pub s_frags_per_group: u32,
    /// # Inodes per group
    pub s_inodes_per_group: u32,
    /// Mount time
    pub s_mtime: u32,
    /// Write time
    pub s_wtime: u32,
    /// Mount count
    pub s_mnt_count: u16,
    /// Maximal mount count
    pub s_max_mnt_count: u16,
    /// Magic signature
    pub s_magic: u16,
    /// File system state
    pub s_state: u16,
    /// Behaviour when detecting errors
    pub s_errors: u16,
    /// Minor revision level
    pub s_minor_rev_level: u16,
    /// Time of last check
    pub s_lastcheck: u32,
    /// Max. time between checks
    pub s_checkinterval: u32,
    /// Creator OS
    pub s_creator_os: u32,
    /// Revision level
    pub s_rev_level: u32,
    /// Default uid for reserved blocks
    pub s_def_resuid: u16,
    /// Default gid for reserved blocks
    pub s_def_resgid: u16,
    // The following fields are valid for EXT2_DYNAMIC_REV superblocks
    // only.
    /// First non-reserved inode
    pub s_first_ino: u32,
    /// Size of the inode structure
    pub s_inode_size: u16,
    /// Block group # of this superblock
    pub s_block_group_nr: u16,
    /// Compatible feature set
    pub s_feature_compat: u32,
    /// Incompatible feature set
    pub s_feature_incompat: u32,
    /// Readonly-compatible feature set
    pub s_feature_ro_compat: u32,
    /// 128-bit uuid for volume
    pub s_uuid: [u8; 16],
    /// Volume name
    pub s_volume_name: [u8; 16],
    /// Directory where last mounted
    pub s_last_mounted: [u8; 64],
    /// For compression
    pub s_algorithm_usage_bitmap: u32,
    /// Nr of blocks to try to preallocate
    pub s_prealloc_blocks: u8,
    /// Nr to preallocate for dirs
    pub s_prealloc_dir_blocks: u8,
    pub s_padding1: u16,
    /// Uuid of journal superblock
    pub s_journal_uuid: [u8; 16],
    /// Inode number of journal file
    pub s_journal_inum: u32,
    /// Device number of journal file
    pub s_journal_dev: u32,
    /// Start of list of inodes to delete
    pub s_last_orphan: u32,
    /// HTREE hash seed
    pub s_hash_seed: [u32; 4],
    /// Default hash version to use
    pub s_def_hash_version: u8,
    pub s_reserved_char_pad: u8,
    pub s_reserved_word_pad: u16,
    pub s_default_mount_opts: u32,
    /// First metablock block group
    pub s_first_meta_bg: u32,
    /// Padding to the end of the block
    pub s_reserved: [u32; 190],
}

const_assert!(mem::size_of::<RawExt2Superblock>() == 1024);

/// A block group descriptor.
#[repr(C)]
#[derive(AsBytes, FromBytes, Copy, Clone)]
pub struct Ext2GroupDesc {
    /// Blocks bitmap block
    pub bg_block_bitmap: u32,
    /// Inodes bitmap block
    pub bg_inode_bitmap: u32,
    /// Inodes table block
    pub bg_inode_table: u32,
    /// Free blocks count
    pub bg_free_blocks_count: u16,
    /// Free inodes count
    pub bg_free_inodes_count: u16,
    /// Directories count
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u32; 3],
}

const_assert!(mem::size_of::<Ext2GroupDesc>() == 32);

/// Cooked superblock of a mounted ext2 filesystem.
pub struct Ext2SbInfo {
    pub s_inode_size: u32,
    pub s_first_ino: u32,
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_first_data_block: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_inodes_per_block: u32,
    pub s_itb_per_group: u32,
    pub s_desc_per_block: u32,
    pub s_addr_per_block: u32,
    pub s_addr_per_block_bits: u32,
    pub s_desc_per_block_bits: u32,
    pub s_groups_count: u32,
    pub s_gdb_count: u32,
    pub s_feature_ro_compat: u32,
    pub s_feature_incompat: u32,
    pub s_first_meta_bg: u32,
    pub s_log_block_size: u32,
    /// In-memory copy of the group descriptor table.
    pub group_desc: Vec<Ext2GroupDesc>,
}

impl Ext2SbInfo {
    pub fn group_desc(&self, block_group: u32) -> &Ext2GroupDesc {
        if block_group >= self.s_groups_count {
            panic!("ext2: block group # is too large");
        }
        &self.group_desc[block_group as usize]
    }

    fn group_first_block_no(&self, group: u32) -> u32 {
        group * self.s_blocks_per_group + self.s_first_data_block
    }
}

fn test_root(a: u32, b: u32) -> bool {
    let mut num = b;
    while a > num {
        num *= b;
    }
    num == a
}

/// Groups carrying a (backup) superblock under SPARSE_SUPER: 0, 1 and the
/// powers of 3, 5 and 7.
pub fn ext2_group_sparse(group: u32) -> bool {
    if group <= 1 {
        return true;
    }
    test_root(group, 3) || test_root(group, 5) || test_root(group, 7)
}

/// Number of blocks used by the (primary or backup) superblock in `group`:
/// 0 or 1.
fn bg_has_super(sbi: &Ext2SbInfo, group: u32) -> bool {
    if sbi.s_feature_ro_compat & EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER != 0
        && !ext2_group_sparse(group)
    {
        return false;
    }
    true
}

/// Block number of the `nr`th group-descriptor block.
fn descriptor_loc(sbi: &Ext2SbInfo, logic_sb_block: u32, nr: u32) -> u32 {
    let first_meta_bg = sbi.s_first_meta_bg;

    if sbi.s_feature_incompat & EXT2_FEATURE_INCOMPAT_META_BG == 0 || nr < first_meta_bg {
        return logic_sb_block + nr + 1;
    }
    let bg = sbi.s_desc_per_block * nr;
    let has_super = if bg_has_super(sbi, bg) { 1 } else { 0 };
    sbi.group_first_block_no(bg) + has_super
}

fn ilog2(v: u32) -> u32 {
    assert!(v.is_power_of_two(), "ext2: not a power of two");
    v.trailing_zeros()
}

/// Parses the superblock of `minor` and loads the group descriptor table.
/// Returns the logical block size and the cooked superblock.
///
/// The first read happens with the 1024-byte minimum block size; when the
/// superblock names a bigger one, the device's cached blocks are dropped
/// (their keys are relative to the block size) and the superblock is
/// re-read at its true offset.
pub fn load(k: &Kernel, minor: u32) -> (usize, Ext2SbInfo) {
    let mut blocksize = EXT2_MIN_BLKSIZE;
    k.sb().with_mut(minor, |sb| {
        sb.major = IDEMAJOR;
        sb.minor = minor;
        sb.blocksize = blocksize;
    });

    // Read the 1024 bytes starting at byte 1024.
    let mut logic_sb_block: u32 = 1;
    let bp = k.bread(minor, logic_sb_block);
    let mut es =
        RawExt2Superblock::read_from(&bp.data()[..mem::size_of::<RawExt2Superblock>()]).unwrap();
    drop(bp);

    assert_eq!(
        es.s_magic, EXT2_SUPER_MAGIC,
        "ext2: not an ext2 filesystem"
    );

    blocksize = EXT2_MIN_BLKSIZE << es.s_log_block_size;
    assert!(blocksize <= MAXBSIZE, "ext2: block size too big");

    // If the blocksize doesn't match, re-read the thing.
    if blocksize != EXT2_MIN_BLKSIZE {
        k.bcache().invalidate(minor);
        k.sb().with_mut(minor, |sb| sb.blocksize = blocksize);

        logic_sb_block = (EXT2_MIN_BLKSIZE / blocksize) as u32;
        let offset = EXT2_MIN_BLKSIZE % blocksize;
        let bp = k.bread(minor, logic_sb_block);
        es = RawExt2Superblock::read_from(
            &bp.data()[offset..offset + mem::size_of::<RawExt2Superblock>()],
        )
        .unwrap();
        assert_eq!(es.s_magic, EXT2_SUPER_MAGIC, "ext2: magic mismatch");
    }

    let (inode_size, first_ino) = if es.s_rev_level == EXT2_GOOD_OLD_REV {
        (EXT2_GOOD_OLD_INODE_SIZE, EXT2_GOOD_OLD_FIRST_INO)
    } else {
        (es.s_inode_size as u32, es.s_first_ino)
    };

    assert!(
        es.s_blocks_per_group <= blocksize as u32 * 8,
        "ext2: #blocks per group too big"
    );
    assert!(
        es.s_inodes_per_group <= blocksize as u32 * 8,
        "ext2: #inodes per group too big"
    );

    let desc_per_block = blocksize as u32 / mem::size_of::<Ext2GroupDesc>() as u32;
    let addr_per_block = blocksize as u32 / mem::size_of::<u32>() as u32;
    let groups_count =
        (es.s_blocks_count - es.s_first_data_block - 1) / es.s_blocks_per_group + 1;
    let db_count = (groups_count + desc_per_block - 1) / desc_per_block;

    assert!(
        db_count as usize <= EXT2_MAX_BGC,
        "ext2: group descriptor table too large; raise EXT2_MAX_BGC"
    );

    let mut sbi = Ext2SbInfo {
        s_inode_size: inode_size,
        s_first_ino: first_ino,
        s_inodes_count: es.s_inodes_count,
        s_blocks_count: es.s_blocks_count,
        s_first_data_block: es.s_first_data_block,
        s_blocks_per_group: es.s_blocks_per_group,
        s_inodes_per_group: es.s_inodes_per_group,
        s_inodes_per_block: blocksize as u32 / inode_size,
        s_itb_per_group: es.s_inodes_per_group / (blocksize as u32 / inode_size),
        s_desc_per_block: desc_per_block,
        s_addr_per_block: addr_per_block,
        s_addr_per_block_bits: ilog2(addr_per_block),
        s_desc_per_block_bits: ilog2(desc_per_block),
        s_groups_count: groups_count,
        s_gdb_count: db_count,
        s_feature_ro_compat: es.s_feature_ro_compat,
        s_feature_incompat: es.s_feature_incompat,
        s_first_meta_bg: es.s_first_meta_bg,
        s_log_block_size: es.s_log_block_size,
        group_desc: Vec::new(),
    };

    // Load the group descriptor table.
    let desc_size = mem::size_of::<Ext2GroupDesc>();
    for i in 0..db_count {
        let block = descriptor_loc(&sbi, logic_sb_block, i);
        let bp = k.bread(minor, block);
        for j in 0..desc_per_block as usize {
            if sbi.group_desc.len() as u32 >= groups_count {
                break;
            }
            let off = j * desc_size;
            let desc = Ext2GroupDesc::read_from(&bp.data()[off..off + desc_size]).unwrap();
            sbi.group_desc.push(desc);
        }
    }

    (blocksize, sbi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_groups_are_0_1_and_prime_powers() {
        let sparse: Vec<u32> = (0..50).filter(|g| ext2_group_sparse(*g)).collect();
        assert_eq!(sparse, vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);
    }

    #[test]
    fn magic_sits_at_offset_56() {
        let mut raw = [0u8; 1024];
        raw[56] = 0x53;
        raw[57] = 0xEF;
        let es = RawExt2Superblock::read_from(&raw[..]).unwrap();
        assert_eq!(es.s_magic, EXT2_SUPER_MAGIC);
    }
}
