//! Mounting, cross-mount path resolution and unmounting.

mod common;

use std::sync::Arc;

use common::{boot_empty, S5Image};
use vfs6::{FcntlFlags, KernelError, MemDisk, MemIde, IDEMAJOR, ROOTDEV, T_MOUNT};

const RDONLY: FcntlFlags = FcntlFlags::O_RDONLY;

fn rdwr_create() -> FcntlFlags {
    FcntlFlags::O_RDWR | FcntlFlags::O_CREATE
}

/// Sets up a root filesystem with /dev/sdb (minor 2) carrying a second
/// native image, mounted on /mnt.
fn boot_with_second_disk() -> (vfs6::Kernel, vfs6::Proc, Arc<MemIde>) {
    let (k, _root_disk, ide) = boot_empty();
    ide.attach(2, MemDisk::new(S5Image::new().finish()));

    let p = k.proc();
    k.sys_mkdir(&p, b"/dev").unwrap();
    k.sys_mknod(&p, b"/dev/sdb", IDEMAJOR as u16, 2).unwrap();
    k.sys_mkdir(&p, b"/mnt").unwrap();
    k.sys_mount(&p, b"/dev/sdb", b"/mnt", b"s5").unwrap();
    (k, p, ide)
}

#[test]
fn mount_and_root_lookup() {
    let (k, mut p, _ide) = boot_with_second_disk();

    // The mount point reads as the mounted filesystem's root: same root
    // inode number, but on the mounted device.
    let fd = k.sys_open(&mut p, b"/mnt", RDONLY).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.ino, vfs6::fs::s5::ROOTINO);
    assert_eq!(st.dev, 2);
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn dotdot_crosses_back_to_the_parent_filesystem() {
    let (k, mut p, _ide) = boot_with_second_disk();

    // "/mnt/.." lands on "/", not on the mounted root.
    let fd = k.sys_open(&mut p, b"/mnt/..", RDONLY).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.ino, vfs6::fs::s5::ROOTINO);
    assert_eq!(st.dev, ROOTDEV as i32);
    k.sys_close(&mut p, fd).unwrap();

    // And from inside the mounted tree, ".." keeps working upwards.
    k.sys_chdir(&mut p, b"/mnt").unwrap();
    let fd = k.sys_open(&mut p, b"../dev/sdb", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn files_live_on_the_mounted_device() {
    let (k, mut p, _ide) = boot_with_second_disk();

    let fd = k.sys_open(&mut p, b"/mnt/note", rdwr_create()).unwrap();
    k.sys_write(&p, fd, b"on the second disk").unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.dev, 2);
    k.sys_close(&mut p, fd).unwrap();

    let fd = k.sys_open(&mut p, b"/mnt/note", RDONLY).unwrap();
    let mut buf = [0u8; 32];
    let n = k.sys_read(&p, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"on the second disk");
    k.sys_close(&mut p, fd).unwrap();

    // The file does not exist on the root filesystem.
    assert_eq!(k.sys_open(&mut p, b"/note", RDONLY).unwrap_err(), KernelError::NotFound);
    p.exit(&k);
}

#[test]
fn mount_refuses_bad_arguments() {
    let (k, _root_disk, ide) = boot_empty();
    ide.attach(2, MemDisk::new(S5Image::new().finish()));

    let mut p = k.proc();
    k.sys_mkdir(&p, b"/dev").unwrap();
    k.sys_mkdir(&p, b"/mnt").unwrap();
    k.sys_mknod(&p, b"/dev/sdb", IDEMAJOR as u16, 2).unwrap();
    k.sys_mknod(&p, b"/dev/root", IDEMAJOR as u16, ROOTDEV as u16).unwrap();
    k.sys_mknod(&p, b"/dev/none", IDEMAJOR as u16, 5).unwrap();
    let fd = k.sys_open(&mut p, b"/plainfile", rdwr_create()).unwrap();
    k.sys_close(&mut p, fd).unwrap();

    // Unknown filesystem type.
    assert_eq!(
        k.sys_mount(&p, b"/dev/sdb", b"/mnt", b"vfat"),
        Err(KernelError::NotFound)
    );
    // Mount point must be a directory.
    assert_eq!(
        k.sys_mount(&p, b"/dev/sdb", b"/plainfile", b"s5"),
        Err(KernelError::WrongType)
    );
    // Device path must name a device inode.
    assert_eq!(
        k.sys_mount(&p, b"/plainfile", b"/mnt", b"s5"),
        Err(KernelError::WrongType)
    );
    // The root device cannot be mounted twice.
    assert_eq!(
        k.sys_mount(&p, b"/dev/root", b"/mnt", b"s5"),
        Err(KernelError::InvalidArgument)
    );
    // An unattached minor fails at the driver.
    assert_eq!(
        k.sys_mount(&p, b"/dev/none", b"/mnt", b"s5"),
        Err(KernelError::NotFound)
    );

    // A proper mount still works afterwards, and the same minor cannot be
    // mounted again.
    k.sys_mount(&p, b"/dev/sdb", b"/mnt", b"s5").unwrap();
    k.sys_mkdir(&p, b"/mnt2").unwrap();
    assert_eq!(
        k.sys_mount(&p, b"/dev/sdb", b"/mnt2", b"s5"),
        Err(KernelError::Busy)
    );
    p.exit(&k);
}

#[test]
fn mount_point_stat_shows_mount_type_from_parent() {
    let (k, mut p, _ide) = boot_with_second_disk();

    // Walk the root directory; the "mnt" entry's inode is the mount root,
    // but the on-parent dirent still resolves through iget, so the stat
    // through a fresh open shows the substituted root. The mount table
    // itself must hold exactly one entry for the minor.
    let fd = k.sys_open(&mut p, b"/", RDONLY).unwrap();
    let mut saw_mnt = false;
    while let Some(entry) = k.sys_readdir(&p, fd).unwrap() {
        if entry.name.as_slice() == b"mnt" {
            saw_mnt = true;
        }
    }
    assert!(saw_mnt);
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn umount_busy_then_clean() {
    let (k, mut p, ide) = boot_with_second_disk();

    let fd = k.sys_open(&mut p, b"/mnt/held", rdwr_create()).unwrap();
    // A file is open on the mounted filesystem; the refusal must leave
    // the mount intact.
    assert_eq!(k.sys_umount(&p, b"/dev/sdb"), Err(KernelError::Busy));
    assert!(k.mtable().mountpoint_of(2).is_some());
    assert_eq!(k.fsname(IDEMAJOR, 2), Some("s5"));
    assert!(ide.is_open(2));
    k.sys_close(&mut p, fd).unwrap();

    k.sys_umount(&p, b"/dev/sdb").unwrap();

    // The mount table slot is vacated, the device→fs binding is gone and
    // the block device has been closed: the tables are back to their
    // pre-mount state.
    assert!(k.mtable().mountpoint_of(2).is_none());
    assert!(!k.mtable().is_fs_root(2, vfs6::fs::s5::ROOTINO));
    assert!(k.mtable().is_empty());
    assert_eq!(k.fsname(IDEMAJOR, 2), None);
    assert!(!ide.is_open(2));
    // The root device stays registered and open throughout.
    assert_eq!(k.fsname(IDEMAJOR, ROOTDEV), Some("s5"));
    assert!(ide.is_open(ROOTDEV));

    // The mount point is a plain directory again.
    let fd = k.sys_open(&mut p, b"/mnt", RDONLY).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.dev, ROOTDEV as i32);
    assert_ne!(st.typ, T_MOUNT);
    k.sys_close(&mut p, fd).unwrap();

    // The file created while mounted is gone from this namespace but
    // intact on the device: remount and look.
    k.sys_mount(&p, b"/dev/sdb", b"/mnt", b"s5").unwrap();
    assert!(k.mtable().mountpoint_of(2).is_some());
    assert!(ide.is_open(2));
    let fd = k.sys_open(&mut p, b"/mnt/held", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();
    k.sys_umount(&p, b"/dev/sdb").unwrap();
    assert!(k.mtable().is_empty());
    assert_eq!(k.fsname(IDEMAJOR, 2), None);
    assert!(!ide.is_open(2));
    p.exit(&k);
}
