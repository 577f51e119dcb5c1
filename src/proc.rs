//! The slice of a process the file system cares about: a current working
//! directory and a table of open file descriptors.
//!
//! The scheduler, address spaces and the rest of process life are outside
//! this crate; callers create a `Proc` per task with `Kernel::proc` and
//! retire it with `exit`.

use array_macro::array;

use crate::{error::KernelError, file::RcFile, fs::RcInode, kernel::Kernel, param::NOFILE};

pub struct Proc {
    /// Current directory.
    cwd: RcInode,

    /// Open files, indexed by file descriptor.
    ofile: [Option<RcFile>; NOFILE],
}

impl Proc {
    pub(crate) fn new(cwd: RcInode) -> Proc {
        Proc {
            cwd,
            ofile: array![_ => None; NOFILE],
        }
    }

    pub fn cwd(&self) -> &RcInode {
        &self.cwd
    }

    /// Replaces the working directory, returning the old one for the
    /// caller to release.
    pub(crate) fn chdir(&mut self, cwd: RcInode) -> RcInode {
        core::mem::replace(&mut self.cwd, cwd)
    }

    /// Allocate a file descriptor for the given file. Takes over the file
    /// reference from the caller on success; hands it back when every
    /// descriptor is taken.
    pub(crate) fn fdalloc(&mut self, f: RcFile) -> Result<usize, RcFile> {
        for fd in 0..NOFILE {
            if self.ofile[fd].is_none() {
                self.ofile[fd] = Some(f);
                return Ok(fd);
            }
        }
        Err(f)
    }

    pub(crate) fn file(&self, fd: usize) -> Result<&RcFile, KernelError> {
        self.ofile
            .get(fd)
            .and_then(|f| f.as_ref())
            .ok_or(KernelError::InvalidArgument)
    }

    pub(crate) fn take_file(&mut self, fd: usize) -> Result<RcFile, KernelError> {
        self.ofile
            .get_mut(fd)
            .and_then(|f| f.take())
            .ok_or(KernelError::InvalidArgument)
    }

    /// Closes the process's files and drops its working directory.
    pub fn exit(mut self, k: &Kernel) {
        for fd in 0..NOFILE {
            if let Some(f) = self.ofile[fd].take() {
                f.close(k);
            }
        }
        let tx = k.begin_tx();
        self.cwd.free(k);
        drop(tx);
    }
}
