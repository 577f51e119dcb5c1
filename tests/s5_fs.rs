//! End-to-end tests of the native filesystem through the system-call
//! surface.

mod common;

use common::boot_empty;
use vfs6::{FcntlFlags, KernelError, BSIZE, T_DIR, T_FILE};
use zerocopy::FromBytes;

const RDONLY: FcntlFlags = FcntlFlags::O_RDONLY;

fn rdwr_create() -> FcntlFlags {
    FcntlFlags::O_RDWR | FcntlFlags::O_CREATE
}

#[test]
fn create_write_read_roundtrip() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    let fd = k.sys_open(&mut p, b"/greeting", rdwr_create()).unwrap();
    k.sys_write(&p, fd, b"hello, disk").unwrap();
    k.sys_close(&mut p, fd).unwrap();

    let fd = k.sys_open(&mut p, b"/greeting", RDONLY).unwrap();
    let mut buf = [0u8; 32];
    let n = k.sys_read(&p, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello, disk");
    // A second read sits at end of file.
    assert_eq!(k.sys_read(&p, fd, &mut buf).unwrap(), 0);
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn single_indirect_read_back() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    // 13 * BSIZE crosses from the direct blocks into the single indirect
    // block. Fill each block with its own index.
    let mut data = Vec::new();
    for b in 0..13u8 {
        data.extend(std::iter::repeat(b).take(BSIZE));
    }
    let fd = k.sys_open(&mut p, b"/big", rdwr_create()).unwrap();
    assert_eq!(k.sys_write(&p, fd, &data).unwrap(), data.len());
    k.sys_close(&mut p, fd).unwrap();

    let fd = k.sys_open(&mut p, b"/big", RDONLY).unwrap();
    let mut back = vec![0u8; data.len()];
    let mut got = 0;
    while got < back.len() {
        let n = k.sys_read(&p, fd, &mut back[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(back, data);

    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.size, 13 * BSIZE);
    assert_eq!(st.typ, T_FILE);
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn redundant_slashes_resolve_to_same_file() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    k.sys_mkdir(&p, b"/a").unwrap();
    k.sys_mkdir(&p, b"/a/b").unwrap();
    let fd = k.sys_open(&mut p, b"/a/b/c", rdwr_create()).unwrap();
    k.sys_close(&mut p, fd).unwrap();

    let fd1 = k.sys_open(&mut p, b"/a//b///c", RDONLY).unwrap();
    let fd2 = k.sys_open(&mut p, b"/a/b/c", RDONLY).unwrap();
    let st1 = k.sys_fstat(&p, fd1).unwrap();
    let st2 = k.sys_fstat(&p, fd2).unwrap();
    assert_eq!(st1.ino, st2.ino);
    assert_eq!(st1.dev, st2.dev);
    k.sys_close(&mut p, fd1).unwrap();
    k.sys_close(&mut p, fd2).unwrap();
    p.exit(&k);
}

#[test]
fn unlink_nonempty_dir_fails() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    k.sys_mkdir(&p, b"/a").unwrap();
    k.sys_mkdir(&p, b"/a/b").unwrap();

    assert_eq!(k.sys_unlink(&p, b"/a"), Err(KernelError::Busy));

    // Both directories still resolve.
    let fd = k.sys_open(&mut p, b"/a", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();
    let fd = k.sys_open(&mut p, b"/a/b", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();

    // Empty it out and try again.
    k.sys_unlink(&p, b"/a/b").unwrap();
    k.sys_unlink(&p, b"/a").unwrap();
    assert_eq!(k.sys_open(&mut p, b"/a", RDONLY).unwrap_err(), KernelError::NotFound);
    p.exit(&k);
}

#[test]
fn unlink_dot_and_dotdot_refused() {
    let (k, _disk, _ide) = boot_empty();
    let p = k.proc();
    k.sys_mkdir(&p, b"/d").unwrap();
    assert_eq!(k.sys_unlink(&p, b"/d/."), Err(KernelError::WrongType));
    assert_eq!(k.sys_unlink(&p, b"/d/.."), Err(KernelError::WrongType));
    p.exit(&k);
}

#[test]
fn mkdir_rmdir_preserve_links_and_bitmap() {
    let (k, disk, _ide) = boot_empty();
    let p = k.proc();

    k.sys_mkdir(&p, b"/parent").unwrap();
    let before = disk.snapshot();

    k.sys_mkdir(&p, b"/parent/child").unwrap();
    k.sys_unlink(&p, b"/parent/child").unwrap();

    let after = disk.snapshot();
    // The free bitmap ends up exactly where it started.
    let sb = vfs6::fs::s5::RawSuperblock::read_from(
        &before[BSIZE..BSIZE + core::mem::size_of::<vfs6::fs::s5::RawSuperblock>()],
    )
    .unwrap();
    let bmap = sb.bmapstart as usize * BSIZE;
    assert_eq!(&before[bmap..bmap + BSIZE], &after[bmap..bmap + BSIZE]);
    p.exit(&k);
}

#[test]
fn link_shares_inode_and_unlink_keeps_data() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    let fd = k.sys_open(&mut p, b"/orig", rdwr_create()).unwrap();
    k.sys_write(&p, fd, b"payload").unwrap();
    k.sys_close(&mut p, fd).unwrap();

    k.sys_link(&p, b"/orig", b"/alias").unwrap();

    let fd = k.sys_open(&mut p, b"/alias", RDONLY).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.nlink, 2);

    // Dropping the original name leaves the alias readable.
    k.sys_unlink(&p, b"/orig").unwrap();
    let mut buf = [0u8; 16];
    let n = k.sys_read(&p, fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"payload");
    k.sys_close(&mut p, fd).unwrap();

    k.sys_unlink(&p, b"/alias").unwrap();
    assert_eq!(k.sys_open(&mut p, b"/alias", RDONLY).unwrap_err(), KernelError::NotFound);
    p.exit(&k);
}

#[test]
fn link_to_directory_refused() {
    let (k, _disk, _ide) = boot_empty();
    let p = k.proc();
    k.sys_mkdir(&p, b"/d").unwrap();
    assert_eq!(k.sys_link(&p, b"/d", b"/d2"), Err(KernelError::WrongType));
    p.exit(&k);
}

#[test]
fn open_dir_for_write_refused() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();
    k.sys_mkdir(&p, b"/d").unwrap();
    assert_eq!(
        k.sys_open(&mut p, b"/d", FcntlFlags::O_RDWR).unwrap_err(),
        KernelError::WrongType
    );
    // Read-only open of a directory is allowed.
    let fd = k.sys_open(&mut p, b"/d", RDONLY).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.typ, T_DIR);
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn chdir_and_relative_paths() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    k.sys_mkdir(&p, b"/w").unwrap();
    k.sys_chdir(&mut p, b"/w").unwrap();

    let fd = k.sys_open(&mut p, b"note", rdwr_create()).unwrap();
    k.sys_write(&p, fd, b"x").unwrap();
    k.sys_close(&mut p, fd).unwrap();

    // Visible through the absolute path too.
    let fd = k.sys_open(&mut p, b"/w/note", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();

    // ".." walks back up.
    k.sys_chdir(&mut p, b"..").unwrap();
    let fd = k.sys_open(&mut p, b"w/note", RDONLY).unwrap();
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn dup_shares_the_offset() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    let fd = k.sys_open(&mut p, b"/f", rdwr_create()).unwrap();
    k.sys_write(&p, fd, b"abcdef").unwrap();
    k.sys_close(&mut p, fd).unwrap();

    let fd = k.sys_open(&mut p, b"/f", RDONLY).unwrap();
    let fd2 = k.sys_dup(&mut p, fd).unwrap();

    let mut buf = [0u8; 3];
    k.sys_read(&p, fd, &mut buf).unwrap();
    assert_eq!(&buf, b"abc");
    k.sys_read(&p, fd2, &mut buf).unwrap();
    assert_eq!(&buf, b"def");

    k.sys_close(&mut p, fd).unwrap();
    k.sys_close(&mut p, fd2).unwrap();
    p.exit(&k);
}

#[test]
fn readdir_lists_entries() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    k.sys_mkdir(&p, b"/dir").unwrap();
    let fd = k.sys_open(&mut p, b"/dir/one", rdwr_create()).unwrap();
    k.sys_close(&mut p, fd).unwrap();
    let fd = k.sys_open(&mut p, b"/dir/two", rdwr_create()).unwrap();
    k.sys_close(&mut p, fd).unwrap();

    let fd = k.sys_open(&mut p, b"/dir", RDONLY).unwrap();
    let mut names = Vec::new();
    while let Some(entry) = k.sys_readdir(&p, fd).unwrap() {
        names.push(entry.name.to_vec());
    }
    assert_eq!(
        names,
        vec![b".".to_vec(), b"..".to_vec(), b"one".to_vec(), b"two".to_vec()]
    );
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn pipe_moves_bytes() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    let (rfd, wfd) = k.sys_pipe(&mut p).unwrap();
    k.sys_write(&p, wfd, b"through the pipe").unwrap();
    let mut buf = [0u8; 64];
    let n = k.sys_read(&p, rfd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"through the pipe");

    // Closing the write end makes reads return 0 once drained.
    k.sys_close(&mut p, wfd).unwrap();
    assert_eq!(k.sys_read(&p, rfd, &mut buf).unwrap(), 0);
    k.sys_close(&mut p, rfd).unwrap();
    p.exit(&k);
}

#[test]
fn bad_fd_is_invalid() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();
    let mut buf = [0u8; 4];
    assert_eq!(k.sys_read(&p, 7, &mut buf), Err(KernelError::InvalidArgument));
    assert_eq!(k.sys_close(&mut p, 7), Err(KernelError::InvalidArgument));
    p.exit(&k);
}

#[test]
fn file_growth_stops_at_the_addressing_limit() {
    use vfs6::fs::s5::MAXFILE;

    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    let fd = k.sys_open(&mut p, b"/limit", rdwr_create()).unwrap();
    // Fill the file out to the last addressable byte: all direct blocks
    // plus the whole single-indirect block.
    let chunk = vec![0x11u8; 16 * BSIZE];
    let mut total = 0;
    while total < MAXFILE * BSIZE {
        let n = (MAXFILE * BSIZE - total).min(chunk.len());
        assert_eq!(k.sys_write(&p, fd, &chunk[..n]).unwrap(), n);
        total += n;
    }
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.size, MAXFILE * BSIZE);

    // One more byte does not fit the direct + single-indirect scheme.
    assert_eq!(
        k.sys_write(&p, fd, b"x"),
        Err(KernelError::InvalidArgument)
    );
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

fn zero_read(_k: &vfs6::Kernel, dst: &mut [u8]) -> Result<usize, KernelError> {
    for b in dst.iter_mut() {
        *b = 0;
    }
    Ok(dst.len())
}

fn sink_write(_k: &vfs6::Kernel, src: &[u8]) -> Result<usize, KernelError> {
    Ok(src.len())
}

#[test]
fn character_device_dispatch() {
    let (k, _disk, _ide) = boot_empty();
    let mut p = k.proc();

    k.set_devsw(
        1,
        vfs6::Devsw {
            read: Some(zero_read),
            write: Some(sink_write),
        },
    )
    .unwrap();
    k.sys_mkdir(&p, b"/dev").unwrap();
    k.sys_mknod(&p, b"/dev/zero", 1, 0).unwrap();

    let fd = k.sys_open(&mut p, b"/dev/zero", FcntlFlags::O_RDWR).unwrap();
    let st = k.sys_fstat(&p, fd).unwrap();
    assert_eq!(st.typ, vfs6::T_DEV);

    let mut buf = [0xFFu8; 8];
    assert_eq!(k.sys_read(&p, fd, &mut buf).unwrap(), 8);
    assert!(buf.iter().all(|b| *b == 0));
    assert_eq!(k.sys_write(&p, fd, b"discarded").unwrap(), 9);
    k.sys_close(&mut p, fd).unwrap();

    // A major with no registered driver fails the read.
    k.sys_mknod(&p, b"/dev/bogus", 9, 0).unwrap();
    let fd = k.sys_open(&mut p, b"/dev/bogus", RDONLY).unwrap();
    assert_eq!(
        k.sys_read(&p, fd, &mut buf),
        Err(KernelError::InvalidArgument)
    );
    k.sys_close(&mut p, fd).unwrap();
    p.exit(&k);
}

#[test]
fn concurrent_writers_on_distinct_files() {
    let (k, _disk, _ide) = boot_empty();
    let k = std::sync::Arc::new(k);

    let mut handles = Vec::new();
    for t in 0..4u8 {
        let k = k.clone();
        handles.push(std::thread::spawn(move || {
            let mut p = k.proc();
            let name = format!("/file{}", t);
            let fd = k
                .sys_open(&mut p, name.as_bytes(), FcntlFlags::O_RDWR | FcntlFlags::O_CREATE)
                .unwrap();
            let data = vec![t; 3 * BSIZE];
            k.sys_write(&p, fd, &data).unwrap();
            k.sys_close(&mut p, fd).unwrap();
            p.exit(&k);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let mut p = k.proc();
    for t in 0..4u8 {
        let name = format!("/file{}", t);
        let fd = k.sys_open(&mut p, name.as_bytes(), RDONLY).unwrap();
        let mut buf = vec![0u8; 3 * BSIZE];
        let mut got = 0;
        while got < buf.len() {
            let n = k.sys_read(&p, fd, &mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        assert!(buf.iter().all(|b| *b == t));
        k.sys_close(&mut p, fd).unwrap();
    }
    p.exit(&k);
}
