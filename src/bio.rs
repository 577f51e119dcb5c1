//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also
//! provides a synchronization point for disk blocks used by multiple
//! threads.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `Kernel::bread`.
//! * After changing buffer data, call `Kernel::bwrite` to write it to disk,
//!   or `Tx::write` to give it to the log.
//! * Dropping the buffer releases it (brelse).
//! * Only one thread at a time can use a buffer, so do not keep them longer
//!   than necessary.
//!
//! Each buffer carries the BUSY/VALID/DIRTY flags:
//! * BUSY means some thread holds the buffer; there is exactly one holder.
//! * VALID means the contents reflect what is on disk.
//! * DIRTY means the contents must reach disk before the buffer can be
//!   recycled; the log uses this to pin blocks until commit.
//!
//! At most one buffer maps any (dev, blockno) pair at any time.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use array_macro::array;
use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    lock::{SpinLock, WaitChannel},
    param::{MAXBSIZE, NBUF},
};

bitflags! {
    pub struct BufFlags: u32 {
        /// Buffer is held by some thread.
        const BUSY = 0x1;
        /// Buffer has been read from disk.
        const VALID = 0x2;
        /// Buffer needs to be written to disk.
        const DIRTY = 0x4;
    }
}

struct BufCtl {
    dev: u32,
    blockno: u32,
    flags: BufFlags,
}

impl BufCtl {
    const fn empty() -> Self {
        Self {
            // Does not collide with any real minor.
            dev: u32::MAX,
            blockno: 0,
            flags: BufFlags::empty(),
        }
    }
}

struct BcacheCtl {
    slots: [BufCtl; NBUF],
    /// Buffer indices, most recently used first.
    order: ArrayVec<usize, NBUF>,
}

/// Payload of a buffer. Large enough for the largest backend block size;
/// a transfer moves only the device's logical block size.
// The log header and indirect blocks are read out of buffers as u32
// slices, so the payload must be at least 4-byte aligned.
#[repr(align(8))]
pub struct BufData {
    bytes: [u8; MAXBSIZE],
}

impl Deref for BufData {
    type Target = [u8; MAXBSIZE];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

pub struct BufEntry {
    /// Threads that found the buffer BUSY sleep here; the holder wakes
    /// them on release.
    waitchannel: WaitChannel,

    data: UnsafeCell<BufData>,
}

impl BufEntry {
    fn new() -> Self {
        Self {
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(BufData {
                bytes: [0; MAXBSIZE],
            }),
        }
    }
}

// SAFETY: the payload is accessed only by the thread that set BUSY, which
// the cache lock hands out to exactly one holder at a time.
unsafe impl Sync for BufEntry {}

pub struct Bcache {
    ctl: SpinLock<BcacheCtl>,
    bufs: [BufEntry; NBUF],
}

/// A BUSY reference to a cache buffer. Dropping it releases the buffer and
/// moves it to the head of the LRU list.
pub struct Buf<'s> {
    bcache: &'s Bcache,
    idx: usize,
    dev: u32,
    blockno: u32,
}

impl Bcache {
    pub fn new() -> Self {
        let mut order = ArrayVec::new();
        for i in 0..NBUF {
            order.push(i);
        }
        Self {
            ctl: SpinLock::new(
                "bcache",
                BcacheCtl {
                    slots: array![_ => BufCtl::empty(); NBUF],
                    order,
                },
            ),
            bufs: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Looks up a buffer for block `blockno` on device `dev`, recycling the
    /// least recently used clean buffer on a miss. Returns the BUSY buffer
    /// and whether its contents are VALID.
    pub fn bget(&self, dev: u32, blockno: u32) -> (Buf<'_>, bool) {
        let mut ctl = self.ctl.lock();
        loop {
            // Is the block already cached?
            let mut found = None;
            for &i in ctl.order.iter() {
                let slot = &ctl.slots[i];
                if slot.dev == dev && slot.blockno == blockno {
                    found = Some(i);
                    break;
                }
            }
            if let Some(i) = found {
                if !ctl.slots[i].flags.contains(BufFlags::BUSY) {
                    ctl.slots[i].flags.insert(BufFlags::BUSY);
                    let valid = ctl.slots[i].flags.contains(BufFlags::VALID);
                    return (
                        Buf {
                            bcache: self,
                            idx: i,
                            dev,
                            blockno,
                        },
                        valid,
                    );
                }
                // Contended; wait for the holder and rescan, since the
                // entry may have been recycled meanwhile.
                self.bufs[i].waitchannel.sleep(&mut ctl);
                continue;
            }

            // Not cached; recycle the least recently used buffer that is
            // neither held nor pinned by the log.
            let victim = ctl
                .order
                .iter()
                .rev()
                .copied()
                .find(|&i| !ctl.slots[i].flags.intersects(BufFlags::BUSY | BufFlags::DIRTY));
            let i = victim.expect("bget: no buffers");
            let slot = &mut ctl.slots[i];
            slot.dev = dev;
            slot.blockno = blockno;
            slot.flags = BufFlags::BUSY;
            return (
                Buf {
                    bcache: self,
                    idx: i,
                    dev,
                    blockno,
                },
                false,
            );
        }
    }

    /// Forgets every cached block of `dev`. Used when a mount changes the
    /// device's logical block size and the (dev, blockno) keys go stale.
    pub fn invalidate(&self, dev: u32) {
        let mut ctl = self.ctl.lock();
        for slot in ctl.slots.iter_mut() {
            if slot.dev == dev {
                assert!(
                    !slot.flags.intersects(BufFlags::BUSY | BufFlags::DIRTY),
                    "invalidate: buffer in use"
                );
                slot.dev = u32::MAX;
                slot.blockno = 0;
                slot.flags = BufFlags::empty();
            }
        }
    }

    fn brelse(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        ctl.slots[idx].flags.remove(BufFlags::BUSY);
        let pos = ctl
            .order
            .iter()
            .position(|&i| i == idx)
            .expect("brelse: not on lru list");
        ctl.order.remove(pos);
        ctl.order.insert(0, idx);
        drop(ctl);
        self.bufs[idx].waitchannel.wakeup();
    }
}

impl Buf<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        // SAFETY: this thread holds BUSY, so it has exclusive access.
        unsafe { &*self.bcache.bufs[self.idx].data.get() }
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        // SAFETY: this thread holds BUSY and `&mut self` is exclusive.
        unsafe { &mut *self.bcache.bufs[self.idx].data.get() }
    }

    /// Marks the buffer DIRTY: its contents must reach disk before the
    /// slot can be recycled. The log uses this to pin logged blocks in the
    /// cache until commit.
    pub(crate) fn mark_dirty(&mut self) {
        self.bcache.ctl.lock().slots[self.idx]
            .flags
            .insert(BufFlags::DIRTY);
    }

    /// Completion of a device transfer: contents now match disk.
    pub(crate) fn mark_written(&mut self) {
        let mut ctl = self.bcache.ctl.lock();
        let flags = &mut ctl.slots[self.idx].flags;
        flags.insert(BufFlags::VALID);
        flags.remove(BufFlags::DIRTY);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        self.bcache.brelse(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_buffer_per_block() {
        let bcache = Bcache::new();
        let (b, valid) = bcache.bget(1, 7);
        assert!(!valid);
        drop(b);
        // A second get of the same block must land on the same slot.
        let (b, _) = bcache.bget(1, 7);
        let first = b.idx;
        drop(b);
        let (b, _) = bcache.bget(1, 7);
        assert_eq!(b.idx, first);
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn out_of_buffers_panics() {
        let bcache = Bcache::new();
        let mut held = Vec::new();
        for bn in 0..=NBUF as u32 {
            held.push(bcache.bget(1, bn).0);
        }
    }

    #[test]
    fn lru_recycles_oldest() {
        let bcache = Bcache::new();
        for bn in 0..NBUF as u32 {
            drop(bcache.bget(1, bn));
        }
        // Touch block 0 so block 1 becomes the oldest.
        drop(bcache.bget(1, 0));
        let (b, _) = bcache.bget(1, 1000);
        drop(b);
        // Block 1 must be gone, block 0 still cached.
        let mut cached0 = false;
        let mut cached1 = false;
        let ctl = bcache.ctl.lock();
        for slot in ctl.slots.iter() {
            if slot.dev == 1 && slot.blockno == 0 {
                cached0 = true;
            }
            if slot.dev == 1 && slot.blockno == 1 {
                cached1 = true;
            }
        }
        assert!(cached0 && !cached1);
    }
}
