//! `pidfd_open(2)` + `process_madvise(2)`, used by the mover and the age
//! policy's swap-out path to `MADV_PAGEOUT` a set of ranges instead of
//! `move_pages`-ing them to a real node.
use crate::{addr::range::AddrRanges, deps::log::debug, error::Error};

pub const MADV_PAGEOUT: i32 = 21;
pub const MADV_COLD: i32 = 20;
/// Used by the prompt's `swap -in` (spec.md §6) to fault pages back in.
pub const MADV_WILLNEED: i32 = 3;

/// A scoped handle to a `pidfd`. Closed on drop via the `File` wrapper so
/// the descriptor is released on every exit path, including panics.
pub struct Pidfd {
    file: std::fs::File,
}

impl Pidfd {
    pub fn open(pid: i32) -> Result<Self, Error> {
        debug!("pidfd_open(pid={})", pid);
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(Error::syscall("pidfd_open", std::io::Error::last_os_error()));
        }

        use std::os::unix::io::FromRawFd;
        let file = unsafe { std::fs::File::from_raw_fd(fd as std::os::unix::io::RawFd) };
        Ok(Self { file })
    }

    fn raw_fd(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        self.file.as_raw_fd()
    }
}

/// Issues `process_madvise(pidfd, iovec[], advice, 0)` over every page-aligned
/// range the caller supplies.
pub fn process_madvise(pidfd: &Pidfd, ranges: &AddrRanges, advice: i32) -> Result<usize, Error> {
    const PAGE: u64 = 4096;

    let iovecs: Vec<libc::iovec> = ranges
        .iter()
        .map(|r| libc::iovec {
            iov_base: r.addr() as *mut libc::c_void,
            iov_len:  (r.length() as u64 * PAGE) as libc::size_t,
        })
        .collect();

    if iovecs.is_empty() {
        return Ok(0);
    }

    debug!("process_madvise(pidfd={}, ranges={}, advice={})", pidfd.raw_fd(), iovecs.len(), advice);

    let ret = unsafe {
        libc::syscall(
            libc::SYS_process_madvise,
            pidfd.raw_fd() as libc::c_int,
            iovecs.as_ptr(),
            iovecs.len() as libc::c_ulong,
            advice as libc::c_int,
            0 as libc::c_uint,
        )
    };

    if ret < 0 {
        return Err(Error::syscall("process_madvise", std::io::Error::last_os_error()));
    }

    Ok(ret as usize)
}
