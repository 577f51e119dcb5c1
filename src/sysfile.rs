//! File-system calls. Mostly argument checking and reference
//! book-keeping; the real work happens in the VFS and the backends.
//!
//! Every call that can modify the disk brackets itself in a transaction,
//! so a crash leaves each call either fully applied or absent.

use core::sync::atomic::AtomicU32;

use crate::{
    error::KernelError,
    fcntl::FcntlFlags,
    file::FileType,
    fs::{InodeGuard, InodeType, Path, RcInode, Tx, VfsOps},
    kernel::Kernel,
    param::ROOTDEV,
    pipe::Pipe,
    proc::Proc,
    stat::Stat,
};

impl Kernel {
    /// Create the inode `path` names, of type `typ`. Returns the inode,
    /// still locked, with one reference held. An existing file is simply
    /// returned when a plain file was asked for.
    fn create<'s>(
        &'s self,
        p: &Proc,
        path: &Path,
        typ: InodeType,
        tx: &Tx<'_>,
    ) -> Result<(RcInode, InodeGuard<'s>), KernelError> {
        let (dp, name) = self.nameiparent(p, path)?;
        let mut dpg = dp.lock(self);

        if let Ok((ip, _)) = dpg.dirlookup(self, name.as_bytes()) {
            drop(dpg);
            dp.free(self);
            let ipg = ip.lock(self);
            if typ == InodeType::File && ipg.typ == InodeType::File {
                return Ok((ip, ipg));
            }
            drop(ipg);
            ip.free(self);
            return Err(KernelError::AlreadyExists);
        }

        let fst = self.fstype(dpg.inode.fst());
        let ip = fst.ops.ialloc(self, tx, dpg.dev(), typ);
        let mut ipg = ip.lock(self);
        ipg.nlink = 1;
        ipg.update(self, tx);

        if typ == InodeType::Dir {
            // Create . and .. entries; the ".." link is counted on the
            // parent, but "." is not counted on ip to avoid a cyclic
            // reference.
            dpg.nlink += 1;
            dpg.update(self, tx);

            let inum = ipg.inum();
            let parent_inum = dpg.inum();
            ipg.dirlink(self, tx, b".", inum)
                .and_then(|_| ipg.dirlink(self, tx, b"..", parent_inum))
                .expect("create dots");
        }

        dpg.dirlink(self, tx, name.as_bytes(), ipg.inum())
            .expect("create: dirlink");
        drop(dpg);
        dp.free(self);
        Ok((ip, ipg))
    }

    pub fn sys_open(
        &self,
        p: &mut Proc,
        path: &[u8],
        omode: FcntlFlags,
    ) -> Result<usize, KernelError> {
        let path = Path::new(path);
        let tx = self.begin_tx();

        let (ip, typ) = if omode.contains(FcntlFlags::O_CREATE) {
            let (ip, ipg) = self.create(p, path, InodeType::File, &tx)?;
            let typ = ipg.typ;
            drop(ipg);
            (ip, typ)
        } else {
            let ip = self.namei(p, path)?;
            let ipg = ip.lock(self);
            let typ = ipg.typ;
            if typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
                drop(ipg);
                ip.free(self);
                return Err(KernelError::WrongType);
            }
            drop(ipg);
            (ip, typ)
        };

        let filetype = match typ {
            InodeType::Device { major, .. } => FileType::Device { ip, major },
            _ => FileType::Inode {
                ip,
                off: AtomicU32::new(0),
            },
        };

        let f = match self.ftable().alloc(
            filetype,
            !omode.intersects(FcntlFlags::O_WRONLY),
            omode.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR),
        ) {
            Ok(f) => f,
            Err(filetype) => {
                match filetype {
                    FileType::Inode { ip, .. } | FileType::Device { ip, .. } => ip.free(self),
                    FileType::Pipe { .. } => {}
                }
                return Err(KernelError::Exhausted);
            }
        };
        drop(tx);

        match p.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                f.close(self);
                Err(KernelError::Exhausted)
            }
        }
    }

    pub fn sys_read(&self, p: &Proc, fd: usize, dst: &mut [u8]) -> Result<usize, KernelError> {
        p.file(fd)?.read(self, dst)
    }

    pub fn sys_write(&self, p: &Proc, fd: usize, src: &[u8]) -> Result<usize, KernelError> {
        p.file(fd)?.write(self, src)
    }

    pub fn sys_close(&self, p: &mut Proc, fd: usize) -> Result<(), KernelError> {
        p.take_file(fd)?.close(self);
        Ok(())
    }

    pub fn sys_dup(&self, p: &mut Proc, fd: usize) -> Result<usize, KernelError> {
        let f = p.file(fd)?.dup();
        match p.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                f.close(self);
                Err(KernelError::Exhausted)
            }
        }
    }

    pub fn sys_fstat(&self, p: &Proc, fd: usize) -> Result<Stat, KernelError> {
        p.file(fd)?.stat(self)
    }

    /// Read the next entry of the open directory `fd`, or `None` at the
    /// end.
    pub fn sys_readdir(
        &self,
        p: &Proc,
        fd: usize,
    ) -> Result<Option<crate::fs::DirEnt>, KernelError> {
        p.file(fd)?.readdir(self)
    }

    /// Create the path `new` as a link to the same inode as `old`.
    pub fn sys_link(&self, p: &Proc, old: &[u8], new: &[u8]) -> Result<(), KernelError> {
        let tx = self.begin_tx();

        let ip = self.namei(p, Path::new(old))?;
        let mut ipg = ip.lock(self);
        if ipg.typ == InodeType::Dir {
            drop(ipg);
            ip.free(self);
            return Err(KernelError::WrongType);
        }
        ipg.nlink += 1;
        ipg.update(self, &tx);
        drop(ipg);

        let linked = (|| -> Result<(), KernelError> {
            let (dp, name) = self.nameiparent(p, Path::new(new))?;
            let mut dpg = dp.lock(self);
            if dpg.dev() != ip.dev(self) {
                drop(dpg);
                dp.free(self);
                return Err(KernelError::WrongType);
            }
            let r = dpg.dirlink(self, &tx, name.as_bytes(), ip.inum(self));
            drop(dpg);
            dp.free(self);
            r
        })();

        match linked {
            Ok(()) => {
                ip.free(self);
                Ok(())
            }
            Err(err) => {
                let mut ipg = ip.lock(self);
                ipg.nlink -= 1;
                ipg.update(self, &tx);
                drop(ipg);
                ip.free(self);
                Err(err)
            }
        }
    }

    pub fn sys_unlink(&self, p: &Proc, path: &[u8]) -> Result<(), KernelError> {
        let tx = self.begin_tx();

        let (dp, name) = self.nameiparent(p, Path::new(path))?;
        let mut dpg = dp.lock(self);

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            drop(dpg);
            dp.free(self);
            return Err(KernelError::WrongType);
        }

        let (ip, off) = match dpg.dirlookup(self, name.as_bytes()) {
            Ok(found) => found,
            Err(err) => {
                drop(dpg);
                dp.free(self);
                return Err(err);
            }
        };
        let mut ipg = ip.lock(self);
        assert!(ipg.nlink >= 1, "unlink: nlink < 1");

        if ipg.typ == InodeType::Dir && !ipg.is_dir_empty(self) {
            drop(ipg);
            ip.free(self);
            drop(dpg);
            dp.free(self);
            return Err(KernelError::Busy);
        }

        dpg.unlink_at(self, &tx, off).expect("unlink: writei");
        if ipg.typ == InodeType::Dir {
            dpg.nlink -= 1;
            dpg.update(self, &tx);
        }
        drop(dpg);
        dp.free(self);

        ipg.nlink -= 1;
        ipg.update(self, &tx);
        drop(ipg);
        ip.free(self);
        Ok(())
    }

    pub fn sys_mkdir(&self, p: &Proc, path: &[u8]) -> Result<(), KernelError> {
        let tx = self.begin_tx();
        let (ip, ipg) = self.create(p, Path::new(path), InodeType::Dir, &tx)?;
        drop(ipg);
        ip.free(self);
        Ok(())
    }

    pub fn sys_mknod(
        &self,
        p: &Proc,
        path: &[u8],
        major: u16,
        minor: u16,
    ) -> Result<(), KernelError> {
        let tx = self.begin_tx();
        let (ip, ipg) = self.create(p, Path::new(path), InodeType::Device { major, minor }, &tx)?;
        drop(ipg);
        ip.free(self);
        Ok(())
    }

    pub fn sys_chdir(&self, p: &mut Proc, path: &[u8]) -> Result<(), KernelError> {
        let tx = self.begin_tx();
        let ip = self.namei(p, Path::new(path))?;
        let ipg = ip.lock(self);
        if ipg.typ != InodeType::Dir {
            drop(ipg);
            ip.free(self);
            return Err(KernelError::WrongType);
        }
        drop(ipg);
        let old = p.chdir(ip);
        old.free(self);
        drop(tx);
        Ok(())
    }

    /// Create a pipe; returns the (read, write) file descriptors.
    pub fn sys_pipe(&self, p: &mut Proc) -> Result<(usize, usize), KernelError> {
        let pipe = Pipe::new();
        let rf = self
            .ftable()
            .alloc(FileType::Pipe { pipe: pipe.clone() }, true, false)
            .map_err(|_| KernelError::Exhausted)?;
        let wf = match self.ftable().alloc(FileType::Pipe { pipe }, false, true) {
            Ok(wf) => wf,
            Err(_) => {
                rf.close(self);
                return Err(KernelError::Exhausted);
            }
        };

        let fd0 = match p.fdalloc(rf) {
            Ok(fd) => fd,
            Err(rf) => {
                rf.close(self);
                wf.close(self);
                return Err(KernelError::Exhausted);
            }
        };
        match p.fdalloc(wf) {
            Ok(fd1) => Ok((fd0, fd1)),
            Err(wf) => {
                wf.close(self);
                if let Ok(rf) = p.take_file(fd0) {
                    rf.close(self);
                }
                Err(KernelError::Exhausted)
            }
        }
    }

    /// Mount the filesystem named `fsname` living on the device inode at
    /// `devpath` over the directory at `mountpath`.
    pub fn sys_mount(
        &self,
        p: &Proc,
        devpath: &[u8],
        mountpath: &[u8],
        fsname: &[u8],
    ) -> Result<(), KernelError> {
        // Both path references are dropped on every exit; the mount table
        // keeps its own.
        let mp = scopeguard::guard(self.namei(p, Path::new(mountpath))?, |mp| mp.free(self));
        let devi = scopeguard::guard(self.namei(p, Path::new(devpath))?, |devi| devi.free(self));

        let fst_idx = match self.vfssw().getfs(fsname) {
            Some(idx) => idx,
            None => {
                log::warn!("mount: filesystem type not found");
                return Err(KernelError::NotFound);
            }
        };

        // We only mount over directory nodes that nothing else holds.
        let mut mpg = mp.lock(self);
        if mpg.typ != InodeType::Dir || mp.nref(self) > 1 {
            return Err(KernelError::WrongType);
        }

        // The device inode must be a device special file.
        let dvg = devi.lock(self);
        let (major, minor) = match dvg.typ {
            InodeType::Device { major, minor } => (major as u32, minor as u32),
            _ => return Err(KernelError::WrongType),
        };
        drop(dvg);

        if minor == 0 || minor == ROOTDEV || minor as usize >= crate::param::NMINOR {
            return Err(KernelError::InvalidArgument);
        }

        if self.bdevs().open(major, minor).is_err() {
            return Err(KernelError::NotFound);
        }

        // Record the filesystem type carried by this device, so the inode
        // cache can bind dispatch tables for it.
        if let Err(err) = self.vfslist().put(major, minor, fst_idx) {
            let _ = self.bdevs().close(major, minor);
            return Err(err);
        }

        let fst = self.fstype(fst_idx);
        match fst.ops.mount(self, major, minor, &*mp) {
            Ok(()) => {
                mpg.typ = InodeType::Mount;
                drop(mpg);
                mp.set_mounted(self, true);
                log::info!(
                    "mount: dev {} on inode {} type {}",
                    minor,
                    mp.inum(self),
                    fst.name
                );
                Ok(())
            }
            Err(err) => {
                self.vfslist().remove(major, minor);
                let _ = self.bdevs().close(major, minor);
                Err(err)
            }
        }
    }

    /// Unmount the filesystem on the device inode at `devpath`.
    pub fn sys_umount(&self, p: &Proc, devpath: &[u8]) -> Result<(), KernelError> {
        let devi = scopeguard::guard(self.namei(p, Path::new(devpath))?, |devi| {
            devi.free(self)
        });
        let dvg = devi.lock(self);
        let (major, minor) = match dvg.typ {
            InodeType::Device { major, minor } => (major as u32, minor as u32),
            _ => return Err(KernelError::WrongType),
        };
        drop(dvg);

        if minor == ROOTDEV {
            return Err(KernelError::InvalidArgument);
        }
        let fst_idx = self
            .vfslist()
            .get(major, minor)
            .ok_or(KernelError::NotFound)?;

        let fst = self.fstype(fst_idx);
        let tx = self.begin_tx();
        let unmounted = fst.ops.unmount(self, minor);
        drop(tx);

        match unmounted {
            Ok(()) => {
                self.vfslist().remove(major, minor);
                let _ = self.bdevs().close(major, minor);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
