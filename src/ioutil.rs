use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::err;

/// Reads until `buf` is full, the fd would block, or the peer is gone.
/// Returns the number of bytes moved and whether a hangup was observed
/// (EOF on read). EINTR is retried; EAGAIN is a short success; any other
/// error is a programming or resource failure and aborts.
pub fn atomic_read(fd: RawFd, buf: &mut [u8]) -> (usize, bool) {
    let mut total = 0;
    while total < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            )
        };
        if n == -1 {
            match Errno::last() {
                Errno::EAGAIN => return (total, false),
                Errno::EINTR => continue,
                Errno::EPIPE | Errno::ECONNRESET => return (total, true),
                e => panic!("atomic_read(fd={fd}): {e}"),
            }
        }
        if n == 0 {
            return (total, true);
        }
        total += n as usize;
    }
    (total, false)
}

/// Write-side counterpart of [`atomic_read`]: EPIPE/ECONNRESET report a
/// hangup, EAGAIN a short success. Callers must have SIGPIPE ignored.
pub fn atomic_write(fd: RawFd, buf: &[u8]) -> (usize, bool) {
    let mut total = 0;
    while total < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[total..].as_ptr() as *const libc::c_void,
                buf.len() - total,
            )
        };
        if n == -1 {
            match Errno::last() {
                Errno::EAGAIN => return (total, false),
                Errno::EINTR => continue,
                Errno::EPIPE | Errno::ECONNRESET => return (total, true),
                e => panic!("atomic_write(fd={fd}): {e}"),
            }
        }
        total += n as usize;
    }
    (total, false)
}

pub fn pipe_cloexec() -> nix::Result<(OwnedFd, OwnedFd)> {
    pipe_flags(libc::O_CLOEXEC)
}

pub fn pipe_plain() -> nix::Result<(OwnedFd, OwnedFd)> {
    pipe_flags(0)
}

fn pipe_flags(flags: libc::c_int) -> nix::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    err(unsafe { libc::pipe2(fds.as_mut_ptr(), flags) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// One-shot, level-triggered shutdown signal for a thread blocked in
/// [`wait_readable_or_stop`]. The read end stays readable forever after
/// the first poke, even when poked before the waiter arrives.
pub struct StopPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl StopPipe {
    pub fn new() -> nix::Result<Self> {
        let (read, write) = pipe_cloexec()?;
        Ok(Self { read, write })
    }

    pub fn poke(&self) {
        let _ = atomic_write(self.write.as_raw_fd(), b"x");
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub stop: bool,
}

/// Blocks until `data_fd` is readable or `stop_fd` was poked, whichever
/// comes first; both may be reported at once. POLLHUP counts as readable
/// so a closed source drains through the normal read path.
pub fn wait_readable_or_stop(data_fd: RawFd, stop_fd: RawFd) -> Readiness {
    let mut fds = [
        libc::pollfd {
            fd: data_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: stop_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rv == -1 {
            match Errno::last() {
                Errno::EINTR => continue,
                e => panic!("poll: {e}"),
            }
        }

        let ready = Readiness {
            readable: fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            stop: fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0,
        };
        if ready.readable || ready.stop {
            return ready;
        }
    }
}

/// Readable check with revents semantics shared by the poll loops in the
/// attach-side binaries.
pub fn revents_readable(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_roundtrip() {
        let (r, w) = pipe_cloexec().unwrap();

        let (n, hup) = atomic_write(w.as_raw_fd(), b"hello");
        assert_eq!(n, 5);
        assert!(!hup);

        let mut buf = [0u8; 5];
        let (n, hup) = atomic_read(r.as_raw_fd(), &mut buf);
        assert_eq!(n, 5);
        assert!(!hup);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn atomic_read_reports_hup_after_drain() {
        let (r, w) = pipe_cloexec().unwrap();
        atomic_write(w.as_raw_fd(), b"tail");
        drop(w);

        let mut buf = [0u8; 16];
        let (n, hup) = atomic_read(r.as_raw_fd(), &mut buf);
        assert_eq!(n, 4);
        assert!(hup);
        assert_eq!(&buf[..4], b"tail");
    }

    #[test]
    fn atomic_read_short_on_nonblocking() {
        let (r, w) = pipe_cloexec().unwrap();
        crate::set_nonblocking(r.as_raw_fd()).unwrap();
        atomic_write(w.as_raw_fd(), b"ab");

        let mut buf = [0u8; 16];
        let (n, hup) = atomic_read(r.as_raw_fd(), &mut buf);
        assert_eq!(n, 2);
        assert!(!hup);
    }

    #[test]
    fn stop_pipe_observed_before_wait() {
        let (data_r, _data_w) = pipe_cloexec().unwrap();
        let stop = StopPipe::new().unwrap();
        stop.poke();

        let ev = wait_readable_or_stop(data_r.as_raw_fd(), stop.read_fd());
        assert!(ev.stop);
        assert!(!ev.readable);
    }

    #[test]
    fn data_wakes_waiter() {
        let (data_r, data_w) = pipe_cloexec().unwrap();
        let stop = StopPipe::new().unwrap();
        atomic_write(data_w.as_raw_fd(), b"x");

        let ev = wait_readable_or_stop(data_r.as_raw_fd(), stop.read_fd());
        assert!(ev.readable);
        assert!(!ev.stop);
    }
}
