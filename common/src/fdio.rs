//! Thin safe wrappers over the raw file-descriptor syscalls the transfer
//! core needs. All `unsafe` in the engine is confined to this module.
//!
//! The engine deliberately works on raw descriptor numbers: standard input
//! and output must never be closed by a `File` drop, and the same read and
//! write paths have to serve pipes, regular files, and block devices.

use std::io;
use std::os::unix::io::RawFd;

/// Read into `buf`, returning 0 on end of file.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Write from `buf`, returning the number of bytes accepted.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Write the whole of `buf`, retrying on interruption and short writes.
/// Used for display output, where a torn line is worse than blocking.
pub fn write_retry(fd: RawFd, buf: &[u8]) {
    let mut offset = 0;
    while offset < buf.len() {
        match write_fd(fd, &buf[offset..]) {
            Ok(0) => return,
            Ok(n) => offset += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

fn poll_one(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        // An interrupting signal is not an error here: the caller's next
        // loop turn will observe whatever flag the handler latched.
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

/// Wait until `fd` is readable (or has hit end of file), up to the timeout.
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    poll_one(fd, libc::POLLIN, timeout_ms)
}

/// Wait until `fd` accepts writes, up to the timeout.
pub fn poll_writable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
    poll_one(fd, libc::POLLOUT, timeout_ms)
}

/// Move up to `len` bytes from `fd_in` to `fd_out` without staging them in
/// userspace. At least one side must be a pipe.
#[cfg(target_os = "linux")]
pub fn splice_fds(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<usize> {
    let rc = unsafe {
        libc::splice(
            fd_in,
            std::ptr::null_mut(),
            fd_out,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MORE,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn splice_fds(_fd_in: RawFd, _fd_out: RawFd, _len: usize) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

/// Number of bytes sitting in a pipe that the far end has not yet read.
pub fn bytes_pending_in_pipe(fd: RawFd) -> io::Result<u64> {
    let mut pending: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(pending.max(0) as u64)
    }
}

fn fstat_fd(fd: RawFd) -> io::Result<libc::stat> {
    let mut sb = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(fd, sb.as_mut_ptr()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { sb.assume_init() })
    }
}

/// Whether the descriptor refers to a pipe or FIFO.
pub fn is_pipe(fd: RawFd) -> bool {
    match fstat_fd(fd) {
        Ok(sb) => (sb.st_mode & libc::S_IFMT) == libc::S_IFIFO,
        Err(_) => false,
    }
}

/// (device, inode, mode, size, block size) of an open descriptor.
pub struct FdStat {
    pub dev: u64,
    pub ino: u64,
    pub is_regular: bool,
    pub is_block: bool,
    pub size: u64,
    pub block_size: u64,
}

pub fn stat_fd(fd: RawFd) -> io::Result<FdStat> {
    let sb = fstat_fd(fd)?;
    let fmt = sb.st_mode & libc::S_IFMT;
    Ok(FdStat {
        dev: sb.st_dev as u64,
        ino: sb.st_ino as u64,
        is_regular: fmt == libc::S_IFREG,
        is_block: fmt == libc::S_IFBLK,
        size: sb.st_size.max(0) as u64,
        block_size: sb.st_blksize.max(0) as u64,
    })
}

/// Toggle `O_DIRECT` on a descriptor. Ignored on platforms without it.
pub fn set_direct_io(fd: RawFd, enabled: bool) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if enabled {
            flags | libc::O_DIRECT
        } else {
            flags & !libc::O_DIRECT
        };
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, enabled);
    }
    Ok(())
}

/// Tell the kernel we will read this descriptor sequentially. Advisory
/// only; failures are uninteresting.
pub fn advise_sequential(fd: RawFd) {
    #[cfg(target_os = "linux")]
    unsafe {
        let _ = libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
    }
}

/// Flush written data (not metadata) to stable storage.
pub fn fdatasync_fd(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::fdatasync(fd) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Seek forward by `offset` bytes; returns the new position.
pub fn seek_forward(fd: RawFd, offset: i64) -> io::Result<u64> {
    let rc = unsafe { libc::lseek(fd, offset, libc::SEEK_CUR) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as u64)
    }
}

/// Seek to an absolute position.
pub fn seek_to(fd: RawFd, position: u64) -> io::Result<u64> {
    let rc = unsafe { libc::lseek(fd, position as i64, libc::SEEK_SET) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as u64)
    }
}

/// Size of a seekable descriptor, preserving the current offset.
pub fn seekable_size(fd: RawFd) -> io::Result<u64> {
    let here = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
    if here < 0 {
        return Err(io::Error::last_os_error());
    }
    let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::lseek(fd, here, libc::SEEK_SET) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(end as u64)
}

pub fn close_fd(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::close(fd) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
