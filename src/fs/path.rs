//! Paths.
//!
//! Path resolution walks one component at a time, locking each directory
//! only while its entry is looked up. Mount points are crossed in both
//! directions: downwards transparently through `Itable::get`'s root
//! substitution, and upwards by consulting the mount table when `..` is
//! resolved at the root of a mounted filesystem.

use core::cmp;

use super::{InodeType, RcInode, VfsOps, DIRSIZ};
use crate::{
    error::KernelError,
    kernel::Kernel,
    param::{IDEMAJOR, MAXPATH, ROOTDEV},
    proc::Proc,
};

/// One path component.
#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant: no '/' characters, at most DIRSIZ bytes.
    inner: [u8],
}

impl FileName {
    /// Truncates `bytes` to the first DIRSIZ bytes.
    pub fn from_bytes(bytes: &[u8]) -> &Self {
        let bytes = &bytes[..cmp::min(DIRSIZ, bytes.len())];
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // its `#[repr(transparent)]` attribute.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

#[repr(transparent)]
pub struct Path {
    inner: [u8],
}

impl Path {
    pub fn new(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // `#[repr(transparent)]` attribute.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `Some((path, name))` where `name` is the next path element
    /// and `path` is the rest with leading slashes removed, so the caller
    /// can check `path.is_empty_string()` to see if `name` is the last
    /// element. Returns `None` if there is no element to remove.
    ///
    /// Examples:
    ///   skipelem("a/bb/c") = Some(("bb/c", "a"))
    ///   skipelem("///a//bb") = Some(("bb", "a"))
    ///   skipelem("a") = Some(("", "a"))
    ///   skipelem("") = skipelem("////") = None
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or_else(|| bytes.len());

        let name = FileName::from_bytes(&bytes[..len]);

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or_else(|| bytes.len());

        Some((Self::new(&bytes[next_start..]), name))
    }

    /// Returns `true` if the path begins with '/'.
    pub fn is_absolute(&self) -> bool {
        !self.inner.is_empty() && self.inner[0] == b'/'
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Kernel {
    /// Looks up and returns the inode for a path name.
    ///
    /// Must be called inside a transaction since it drops references.
    pub fn namei(&self, proc: &Proc, path: &Path) -> Result<RcInode, KernelError> {
        Ok(self.namex(proc, path, false)?.0)
    }

    /// Returns the inode for the parent directory and the final path
    /// element.
    pub fn nameiparent<'p>(
        &self,
        proc: &Proc,
        path: &'p Path,
    ) -> Result<(RcInode, &'p FileName), KernelError> {
        let (ip, name) = self.namex(proc, path, true)?;
        match name {
            Some(name) => Ok((ip, name)),
            None => {
                ip.free(self);
                Err(KernelError::NotFound)
            }
        }
    }

    fn namex<'p>(
        &self,
        proc: &Proc,
        mut path: &'p Path,
        parent: bool,
    ) -> Result<(RcInode, Option<&'p FileName>), KernelError> {
        if path.as_bytes().len() > MAXPATH {
            return Err(KernelError::InvalidArgument);
        }

        let mut ip = if path.is_absolute() {
            let fst = self
                .vfslist()
                .get(IDEMAJOR, ROOTDEV)
                .expect("namex: no root filesystem");
            self.fstype(fst).ops.getroot(self, IDEMAJOR, ROOTDEV)
        } else {
            proc.cwd().dup(self)
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut guard = ip.lock(self);
            if guard.typ != InodeType::Dir && guard.typ != InodeType::Mount {
                drop(guard);
                ip.free(self);
                return Err(KernelError::NotFound);
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(guard);
                return Ok((ip, Some(name)));
            }

            let next = loop {
                let next = match guard.dirlookup(self, name.as_bytes()) {
                    Ok((next, _)) => next,
                    Err(_) => {
                        drop(guard);
                        ip.free(self);
                        return Err(KernelError::NotFound);
                    }
                };

                // ".." at the root of a mounted filesystem names that same
                // root; redo the lookup from the mount point so it lands
                // on the mount point's parent instead.
                let (ipdev, ipinum) = (guard.dev(), guard.inum());
                if name.as_bytes() == b".."
                    && next.inum(self) == ipinum
                    && self.mtable().is_fs_root(ipdev, ipinum)
                {
                    next.free(self);
                    let (mpdev, mpinum) = self
                        .mtable()
                        .mountpoint_of(ipdev)
                        .expect("namex: root without mount entry");
                    drop(guard);
                    ip.free(self);
                    ip = self.itable().get_raw(self, mpdev, mpinum);
                    guard = ip.lock(self);
                    continue;
                }
                break next;
            };

            drop(guard);
            ip.free(self);
            ip = next;
        }

        if parent {
            ip.free(self);
            return Err(KernelError::NotFound);
        }
        Ok((ip, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elems(path: &Path) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut p = path;
        while let Some((rest, name)) = p.skipelem() {
            out.push(name.as_bytes().to_vec());
            p = rest;
        }
        out
    }

    #[test]
    fn skipelem_splits_components() {
        assert_eq!(elems(Path::new(b"a/bb/c")), vec![b"a".to_vec(), b"bb".to_vec(), b"c".to_vec()]);
        assert_eq!(elems(Path::new(b"///a//bb")), vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(elems(Path::new(b"a")), vec![b"a".to_vec()]);
    }

    #[test]
    fn skipelem_empty_paths() {
        assert!(Path::new(b"").skipelem().is_none());
        assert!(Path::new(b"////").skipelem().is_none());
    }

    #[test]
    fn redundant_slashes_resolve_alike() {
        assert_eq!(elems(Path::new(b"a//b///c")), elems(Path::new(b"a/b/c")));
    }

    #[test]
    fn overlong_component_is_truncated() {
        let (_, name) = Path::new(b"abcdefghijklmnopqrstuvwxyz/x")
            .skipelem()
            .unwrap();
        assert_eq!(name.as_bytes(), &b"abcdefghijklmnopqrstuvwxyz"[..DIRSIZ]);
        assert_eq!(name.as_bytes().len(), DIRSIZ);
    }
}
