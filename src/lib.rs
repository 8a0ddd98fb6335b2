use std::os::fd::RawFd;

use nix::errno::Errno;

pub mod barrier;
pub mod fdpass;
pub mod ioutil;
pub mod mux;
pub mod passwd;
pub mod proc;
pub mod pty;
pub mod pump;
pub mod ring;
pub mod session;
pub mod status;
pub mod unix;

pub trait IsMinusOne {
    fn is_minus_one(&self) -> bool;
}

impl IsMinusOne for i64 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for i32 {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

impl IsMinusOne for isize {
    fn is_minus_one(&self) -> bool {
        *self == -1
    }
}

pub fn err<T: IsMinusOne>(ret: T) -> nix::Result<T> {
    if ret.is_minus_one() {
        Err(Errno::last())
    } else {
        Ok(ret)
    }
}

/// Re-issues the wrapped syscall until it completes with something other
/// than EINTR.
pub fn retry<T: IsMinusOne, F: FnMut() -> T>(mut f: F) -> nix::Result<T> {
    loop {
        match err(f()) {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}

pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fd_flag_cloexec(fd, true)
}

pub fn unset_cloexec(fd: RawFd) -> nix::Result<()> {
    fd_flag_cloexec(fd, false)
}

fn fd_flag_cloexec(fd: RawFd, on: bool) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let flags = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    err(unsafe { libc::fcntl(fd, libc::F_SETFD, flags) })?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    err(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}
