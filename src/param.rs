/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number (character devices).
pub const NDEV: usize = 10;

/// Maximum major number of a block device.
pub const NBDEV: usize = 10;

/// Minor numbers per block major; also sizes the superblock and mount tables.
pub const NMINOR: usize = 8;

/// Maximum number of registered filesystem types.
pub const NVFSSW: usize = 4;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Major number of the block device driver.
pub const IDEMAJOR: u32 = 0;

/// Filesystem type the root device is formatted with.
pub const ROOTFSTYPE: &str = "s5";

/// Native filesystem block size.
pub const BSIZE: usize = 512;

/// Largest logical block size any backend may use; buffers are sized for it.
pub const MAXBSIZE: usize = 4096;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;
