//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call should call `begin_op`/`end_op` to mark its start and
//! end. Usually `begin_op` just increments the count of in-progress FS
//! system calls and returns. But if it thinks the log is close to running
//! out, it sleeps until the last outstanding `end_op` commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    bio::Buf,
    kernel::Kernel,
    lock::SleepableLock,
    param::{BSIZE, LOGSIZE, MAXOPBLOCKS},
};

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: i32,

    /// In commit(), please wait.
    committing: bool,

    /// Block numbers logged so far; the blocks themselves stay pinned in
    /// the buffer cache (DIRTY) until commit installs them.
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// Contents of the on-disk header block.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    /// Sets up the log of device `dev` and replays whatever a crash left
    /// committed but uninstalled.
    pub fn new(k: &Kernel, dev: u32, start: u32, size: u32) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            blocks: ArrayVec::new(),
        };
        log.recover_from_log(k);
        log
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Copy committed blocks from log to their home location.
    fn install_trans(&mut self, k: &Kernel) {
        let dev = self.dev;
        let start = self.start;

        for (tail, blockno) in self.blocks.drain(..).enumerate() {
            // Read log block.
            let lbuf = k.bread(dev, start + tail as u32 + 1);

            // Read dst.
            let mut dbuf = k.bread(dev, blockno);

            // Copy block to dst and write it home. bwrite clears DIRTY,
            // unpinning the cache entry.
            dbuf.data_mut()[..BSIZE].copy_from_slice(&lbuf.data()[..BSIZE]);
            k.bwrite(&mut dbuf);
        }
    }

    /// Read the log header from disk into the in-memory log header.
    fn read_head(&mut self, k: &Kernel) {
        let bp = k.bread(self.dev, self.start);
        let mut head = LogHeader {
            n: 0,
            block: [0; LOGSIZE],
        };
        head.as_bytes_mut()
            .copy_from_slice(&bp.data()[..mem::size_of::<LogHeader>()]);
        drop(bp);

        for b in &head.block[..head.n as usize] {
            self.blocks.push(*b);
        }
    }

    /// Write the in-memory log header to disk. This is the true point at
    /// which the current transaction commits.
    fn write_head(&mut self, k: &Kernel) {
        let mut head = LogHeader {
            n: self.blocks.len() as u32,
            block: [0; LOGSIZE],
        };
        for (db, b) in izip!(&mut head.block, &self.blocks) {
            *db = *b;
        }

        let mut bp = k.bread(self.dev, self.start);
        bp.data_mut()[..mem::size_of::<LogHeader>()].copy_from_slice(head.as_bytes());
        k.bwrite(&mut bp);
    }

    fn recover_from_log(&mut self, k: &Kernel) {
        self.read_head(k);
        if !self.blocks.is_empty() {
            log::info!(
                "log: dev {} recovering {} blocks",
                self.dev,
                self.blocks.len()
            );
        }

        // If committed, copy from log to disk.
        self.install_trans(k);

        // Clear the log.
        self.write_head(k);
    }

    /// Copy modified blocks from the cache to the log area.
    fn write_log(&mut self, k: &Kernel) {
        for (tail, blockno) in self.blocks.iter().enumerate() {
            // Log block.
            let mut to = k.bread(self.dev, self.start + tail as u32 + 1);

            // Cache block, still pinned since log_write.
            let from = k.bread(self.dev, *blockno);

            to.data_mut()[..BSIZE].copy_from_slice(&from.data()[..BSIZE]);
            k.bwrite(&mut to);
        }
    }

    fn commit(&mut self, k: &Kernel) {
        if !self.blocks.is_empty() {
            // Write modified blocks from cache to log.
            self.write_log(k);

            // Write header to disk -- the real commit.
            self.write_head(k);

            // Now install writes to home locations.
            self.install_trans(k);

            // Erase the transaction from the log.
            self.write_head(k);
        }
    }

    /// Caller has modified `b`'s data and is done with the buffer: record
    /// the block number and pin the buffer in the cache by marking it
    /// DIRTY. `commit`/`write_log` will do the disk write.
    ///
    /// This replaces `bwrite`; a typical use is:
    ///   let bp = k.bread(...);
    ///   // modify bp data
    ///   tx.write(bp);
    pub fn write(&mut self, _k: &Kernel, mut b: Buf<'_>) {
        assert!(
            self.blocks.len() < LOGSIZE && (self.blocks.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log write outside of trans");

        // Log absorption: a block logged twice in one transaction is
        // recorded once.
        if !self.blocks.contains(&b.blockno()) {
            self.blocks.push(b.blockno());
        }
        b.mark_dirty();
    }

    /// Called at the start of each FS system call.
    pub fn begin_op(this: &SleepableLock<Log>) {
        let mut guard = this.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.blocks.len() as i32 + (guard.outstanding + 1) * MAXOPBLOCKS as i32
                    > LOGSIZE as i32
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(this: &SleepableLock<Log>, k: &Kernel) {
        let mut guard = this.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: committing");

        if guard.outstanding == 0 {
            // Since outstanding is 0, no ongoing transaction exists and,
            // with committing set, none can start. Commit without holding
            // the lock, since commit sleeps on disk I/O.
            guard.committing = true;
            guard.reacquire_after(|| {
                // SAFETY: committing is set, so no other thread reads or
                // writes the log until it is cleared below.
                let log = unsafe { &mut *this.get_mut_raw() };
                log.commit(k);
            });
            guard.committing = false;
        }

        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        guard.wakeup();
    }
}
