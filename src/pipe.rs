//! Pipes: a bounded byte queue between a read end and a write end.

use std::sync::Arc;

use crate::{
    error::KernelError,
    lock::{SpinLock, WaitChannel},
};

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

enum PipeError {
    WaitForIo,
    NoReader,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// WaitChannel saying there are unread bytes in data.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying there is room to write in data.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    pub fn new() -> Arc<Pipe> {
        Arc::new(Pipe {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        })
    }

    /// Reads up to `dst.len()` bytes. Sleeps while the pipe is empty and
    /// the write end is open; returns 0 at end of stream.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(dst) {
                Ok(read) => {
                    self.write_waitchannel.wakeup();
                    return Ok(read);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                Err(PipeError::NoReader) => unreachable!(),
            }
        }
    }

    /// Writes all of `src`, sleeping whenever the pipe is full. Fails when
    /// the read end is closed.
    pub fn write(&self, src: &[u8]) -> Result<usize, KernelError> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(&src[written..]) {
                Ok(n) => {
                    written += n;
                    self.read_waitchannel.wakeup();
                    if written < src.len() {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(PipeError::NoReader) => return Err(KernelError::BrokenPipe),
                Err(PipeError::WaitForIo) => unreachable!(),
            }
        }
    }

    /// Closes one end; wakes the other so it can observe the state.
    pub fn close(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            drop(inner);
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            drop(inner);
            self.write_waitchannel.wakeup();
        }
    }
}

impl PipeInner {
    /// Tries to write as much of `src` as fits. `Ok(n)` may be a short (or
    /// zero-length) write when the pipe fills up.
    fn try_write(&mut self, src: &[u8]) -> Result<usize, PipeError> {
        if !self.readopen {
            return Err(PipeError::NoReader);
        }
        for (i, b) in src.iter().enumerate() {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // Pipe is full.
                return Ok(i);
            }
            self.data[self.nwrite as usize % PIPESIZE] = *b;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(src.len())
    }

    /// Tries to read up to `dst.len()` bytes. An empty pipe with a live
    /// writer asks the caller to wait.
    fn try_read(&mut self, dst: &mut [u8]) -> Result<usize, PipeError> {
        if self.nread == self.nwrite && self.writeopen {
            return Err(PipeError::WaitForIo);
        }
        for (i, b) in dst.iter_mut().enumerate() {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            *b = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
        }
        Ok(dst.len())
    }
}
