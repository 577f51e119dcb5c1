//! Block device interface code.
//!
//! A block device driver is registered under a major number and services
//! `open`/`close` for its minors plus the transfer path the buffer cache
//! drives. The driver itself (interrupt handling, controller registers) is
//! outside this crate; `rw` is the point where a BUSY buffer is handed to
//! the device and comes back VALID.

use std::sync::Arc;

use array_macro::array;

use crate::{
    error::KernelError,
    lock::SpinLock,
    param::{NBDEV, NMINOR},
};

pub trait BlockDevice: Send + Sync {
    /// Verifies that the disk `minor` is attached.
    fn open(&self, minor: u32) -> Result<(), KernelError>;

    fn close(&self, minor: u32) -> Result<(), KernelError>;

    /// Transfers one logical block of `data.len()` bytes between the
    /// device and `data`. `write` is buffer-to-disk.
    fn rw(&self, minor: u32, blockno: u32, data: &mut [u8], write: bool);
}

/// Block device switch table, indexed by major number.
pub struct BdevTable {
    entries: SpinLock<[Option<Arc<dyn BlockDevice>>; NBDEV]>,
}

impl BdevTable {
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new("bdevtable", array![_ => None; NBDEV]),
        }
    }

    pub fn register(&self, major: u32, dev: Arc<dyn BlockDevice>) -> Result<(), KernelError> {
        if major as usize > NBDEV - 1 {
            return Err(KernelError::InvalidArgument);
        }
        self.entries.lock()[major as usize] = Some(dev);
        Ok(())
    }

    pub fn unregister(&self, major: u32) -> Result<(), KernelError> {
        if major as usize > NBDEV - 1 {
            return Err(KernelError::InvalidArgument);
        }
        self.entries.lock()[major as usize] = None;
        Ok(())
    }

    pub fn get(&self, major: u32) -> Option<Arc<dyn BlockDevice>> {
        self.entries
            .lock()
            .get(major as usize)
            .and_then(|d| d.clone())
    }

    pub fn open(&self, major: u32, minor: u32) -> Result<(), KernelError> {
        self.get(major).ok_or(KernelError::NotFound)?.open(minor)
    }

    pub fn close(&self, major: u32, minor: u32) -> Result<(), KernelError> {
        self.get(major).ok_or(KernelError::NotFound)?.close(minor)
    }
}

/// A memory-backed disk image.
///
/// Tests share the image with a kernel through the `Arc`, so they can
/// snapshot it, "crash" the kernel, and boot a fresh one over the same
/// bytes.
pub struct MemDisk {
    data: SpinLock<Vec<u8>>,
}

impl MemDisk {
    pub fn new(image: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: SpinLock::new("memdisk", image),
        })
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn rw(&self, blockno: u32, buf: &mut [u8], write: bool) {
        let mut data = self.data.lock();
        let off = blockno as usize * buf.len();
        assert!(off + buf.len() <= data.len(), "memdisk: incorrect blockno");
        if write {
            data[off..off + buf.len()].copy_from_slice(buf);
        } else {
            buf.copy_from_slice(&data[off..off + buf.len()]);
        }
    }
}

/// Driver exposing a set of `MemDisk`s as the minors of one major.
pub struct MemIde {
    disks: SpinLock<[Option<Arc<MemDisk>>; NMINOR]>,

    /// Minors the kernel currently holds open.
    opened: SpinLock<[bool; NMINOR]>,
}

impl MemIde {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            disks: SpinLock::new("memide", array![_ => None; NMINOR]),
            opened: SpinLock::new("memide_open", [false; NMINOR]),
        })
    }

    pub fn attach(&self, minor: u32, disk: Arc<MemDisk>) {
        self.disks.lock()[minor as usize] = Some(disk);
    }

    /// Whether the kernel has the minor open (opened and not yet closed).
    pub fn is_open(&self, minor: u32) -> bool {
        self.opened
            .lock()
            .get(minor as usize)
            .copied()
            .unwrap_or(false)
    }

    fn disk(&self, minor: u32) -> Option<Arc<MemDisk>> {
        self.disks
            .lock()
            .get(minor as usize)
            .and_then(|d| d.clone())
    }
}

impl BlockDevice for MemIde {
    fn open(&self, minor: u32) -> Result<(), KernelError> {
        match self.disk(minor) {
            Some(_) => {
                self.opened.lock()[minor as usize] = true;
                Ok(())
            }
            None => Err(KernelError::NotFound),
        }
    }

    fn close(&self, minor: u32) -> Result<(), KernelError> {
        if let Some(open) = self.opened.lock().get_mut(minor as usize) {
            *open = false;
        }
        Ok(())
    }

    fn rw(&self, minor: u32, blockno: u32, data: &mut [u8], write: bool) {
        let disk = self.disk(minor).expect("memide: disk not attached");
        disk.rw(blockno, data, write);
    }
}
