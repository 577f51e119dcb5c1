//! Support for file descriptors: open files and the character-device
//! switch.

use core::sync::atomic::{AtomicU32, Ordering};

use std::sync::Arc;

use crate::{
    error::KernelError,
    fs::RcInode,
    kernel::Kernel,
    param::{BSIZE, MAXOPBLOCKS, NFILE},
    pipe::Pipe,
    stat::Stat,
};

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

pub enum FileType {
    Pipe { pipe: Arc<Pipe> },
    Inode { ip: RcInode, off: AtomicU32 },
    Device { ip: RcInode, major: u16 },
}

/// Map of major device number to character-device functions, consumed by
/// reads and writes on device inodes.
#[derive(Copy, Clone, Default)]
pub struct Devsw {
    pub read: Option<fn(&Kernel, &mut [u8]) -> Result<usize, KernelError>>,
    pub write: Option<fn(&Kernel, &[u8]) -> Result<usize, KernelError>>,
}

/// A counted reference to an open file. `dup` shares the open file (and
/// its offset); `close` drops one reference and releases the file when the
/// last one goes.
pub struct RcFile(Arc<File>);

/// Bounds the number of open files in the system.
pub struct FTable {
    nfile: crate::lock::SpinLock<usize>,
}

impl FTable {
    pub fn new() -> Self {
        Self {
            nfile: crate::lock::SpinLock::new("ftable", 0),
        }
    }

    /// Allocate a file structure. Hands `typ` back when the table is
    /// full so the caller can release the references inside.
    pub fn alloc(&self, typ: FileType, readable: bool, writable: bool) -> Result<RcFile, FileType> {
        let mut nfile = self.nfile.lock();
        if *nfile >= NFILE {
            return Err(typ);
        }
        *nfile += 1;
        Ok(RcFile(Arc::new(File {
            typ,
            readable,
            writable,
        })))
    }

    fn release(&self) {
        let mut nfile = self.nfile.lock();
        *nfile -= 1;
    }
}

impl RcFile {
    pub fn dup(&self) -> RcFile {
        RcFile(self.0.clone())
    }

    /// Get metadata about file.
    pub fn stat(&self, k: &Kernel) -> Result<Stat, KernelError> {
        match &self.0.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => Ok(ip.stat(k)),
            FileType::Pipe { .. } => Err(KernelError::InvalidArgument),
        }
    }

    /// Read from the file into `dst`, advancing the offset by the number
    /// of bytes read.
    pub fn read(&self, k: &Kernel, dst: &mut [u8]) -> Result<usize, KernelError> {
        if !self.0.readable {
            return Err(KernelError::InvalidArgument);
        }

        match &self.0.typ {
            FileType::Pipe { pipe } => pipe.read(dst),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock(k);
                let cur = off.load(Ordering::Relaxed);
                let read = guard.read(k, dst, cur)?;
                off.store(cur.wrapping_add(read as u32), Ordering::Relaxed);
                Ok(read)
            }
            FileType::Device { major, .. } => {
                let read = k
                    .devsw(*major)
                    .and_then(|d| d.read)
                    .ok_or(KernelError::InvalidArgument)?;
                read(k, dst)
            }
        }
    }

    /// Write `src` to the file, advancing the offset.
    pub fn write(&self, k: &Kernel, src: &[u8]) -> Result<usize, KernelError> {
        if !self.0.writable {
            return Err(KernelError::InvalidArgument);
        }

        match &self.0.typ {
            FileType::Pipe { pipe } => pipe.write(src),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including inode, indirect
                // block, allocation blocks, and 2 blocks of slop for
                // non-aligned writes.
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let mut written = 0;
                while written < src.len() {
                    let end = (written + max).min(src.len());
                    let tx = k.begin_tx();
                    let mut guard = ip.lock(k);
                    let cur = off.load(Ordering::Relaxed);
                    let n = guard.write(k, &tx, &src[written..end], cur)?;
                    off.store(cur.wrapping_add(n as u32), Ordering::Relaxed);
                    drop(guard);
                    drop(tx);
                    assert_eq!(n, end - written, "short File::write");
                    written = end;
                }
                Ok(written)
            }
            FileType::Device { major, .. } => {
                let write = k
                    .devsw(*major)
                    .and_then(|d| d.write)
                    .ok_or(KernelError::InvalidArgument)?;
                write(k, src)
            }
        }
    }

    /// Read the next directory entry of an open directory, advancing the
    /// offset past it.
    pub fn readdir(&self, k: &Kernel) -> Result<Option<crate::fs::DirEnt>, KernelError> {
        match &self.0.typ {
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock(k);
                if !matches!(
                    guard.typ,
                    crate::fs::InodeType::Dir | crate::fs::InodeType::Mount
                ) {
                    return Err(KernelError::WrongType);
                }
                let cur = off.load(Ordering::Relaxed);
                match guard.readdir(k, cur) {
                    Some(entry) => {
                        off.store(entry.off, Ordering::Relaxed);
                        Ok(Some(entry))
                    }
                    None => Ok(None),
                }
            }
            _ => Err(KernelError::WrongType),
        }
    }

    /// Close the file, releasing the open-file slot and the underlying
    /// object when this was the last reference.
    pub fn close(self, k: &Kernel) {
        if let Ok(file) = Arc::try_unwrap(self.0) {
            k.ftable().release();
            match file.typ {
                FileType::Pipe { pipe } => pipe.close(file.writable),
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                    // The inode may be freed on disk if its link count is
                    // zero by now.
                    let tx = k.begin_tx();
                    ip.free(k);
                    drop(tx);
                }
            }
        }
    }
}
