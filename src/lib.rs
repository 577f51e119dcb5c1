//! vfs6: the virtual file system layer of a teaching-style UNIX kernel.
//!
//! A polymorphic inode/superblock abstraction multiplexes two on-disk
//! filesystems behind one dispatch surface: the native, log-protected
//! "s5" layout (direct + single-indirect block-addressed inodes) and a
//! read-only ext2 backend that parses the standard Rev-0/Rev-1 layout.
//! Below them sit a fixed-pool buffer cache keyed by (device, block) and
//! the block-device switch; above them path resolution that crosses mount
//! points in both directions, the mount table, and classical UNIX file
//! system calls.
//!
//! The crate is host-testable: the scheduler is replaced by a small lock
//! module (spin locks plus sleep/wakeup channels) and the disk driver by
//! a `BlockDevice` trait with a memory-backed implementation, so whole
//! kernels can be booted over in-memory images, crashed, and booted
//! again.

#![deny(anonymous_parameters)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(non_ascii_idents)]
#![deny(unused_import_braces)]

mod bdev;
mod bio;
mod error;
mod fcntl;
mod file;
pub mod fs;
mod kernel;
mod lock;
mod param;
mod pipe;
mod proc;
mod stat;
mod sysfile;

pub use bdev::{BdevTable, BlockDevice, MemDisk, MemIde};
pub use bio::{Buf, BufData};
pub use error::KernelError;
pub use fcntl::FcntlFlags;
pub use file::{Devsw, RcFile};
pub use kernel::Kernel;
pub use param::{
    BSIZE, IDEMAJOR, LOGSIZE, MAXBSIZE, MAXOPBLOCKS, NBUF, NFILE, NINODE, NOFILE, ROOTDEV,
};
pub use pipe::Pipe;
pub use proc::Proc;
pub use stat::{Stat, T_DEV, T_DIR, T_FILE, T_MOUNT};
