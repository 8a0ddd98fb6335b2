use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Condvar, Mutex};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;

use crate::ioutil::pipe_plain;
use crate::{retry, set_cloexec, unset_cloexec};

/// Single-shot latch between threads. Once lifted, all present and future
/// waiters return immediately; lifting again is a no-op.
pub struct Barrier {
    lifted: Mutex<bool>,
    cv: Condvar,
}

impl Barrier {
    pub fn new() -> Self {
        Self {
            lifted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn lift(&self) {
        let mut lifted = self.lifted.lock().unwrap();
        *lifted = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut lifted = self.lifted.lock().unwrap();
        while !*lifted {
            lifted = self.cv.wait(lifted).unwrap();
        }
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-shot rendezvous between two processes sharing the pipe across
/// fork/clone. The waiter closes its signal end and blocks on a one-byte
/// read; EOF means the peer died before signalling. The fds are created
/// without CLOEXEC so they survive an exec; `set_cloexec` flips both ends
/// for the stretches where they must not leak.
pub struct PipeBarrier {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl PipeBarrier {
    pub fn open() -> nix::Result<Self> {
        let (read, write) = pipe_plain()?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Rebuilds one side of a barrier from fds that crossed an exec.
    ///
    /// # Safety
    /// Both fds must be the two ends of a pipe owned by the caller.
    pub unsafe fn from_raw_fds(read: RawFd, write: RawFd) -> Self {
        Self {
            read: Some(OwnedFd::from_raw_fd(read)),
            write: Some(OwnedFd::from_raw_fd(write)),
        }
    }

    pub fn raw_fds(&self) -> (RawFd, RawFd) {
        (
            self.read.as_ref().map_or(-1, |fd| fd.as_raw_fd()),
            self.write.as_ref().map_or(-1, |fd| fd.as_raw_fd()),
        )
    }

    pub fn set_cloexec(&self, on: bool) -> nix::Result<()> {
        for fd in [&self.read, &self.write].into_iter().flatten() {
            if on {
                set_cloexec(fd.as_raw_fd())?;
            } else {
                unset_cloexec(fd.as_raw_fd())?;
            }
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<()> {
        self.write.take();
        let read = self.read.take().context("barrier already waited")?;

        let mut buf = [0u8; 1];
        let n = retry(|| unsafe {
            libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1)
        })
        .context("barrier read")?;
        if n == 0 {
            bail!("barrier peer went away before signalling");
        }
        Ok(())
    }

    pub fn signal(&mut self) -> Result<()> {
        self.read.take();
        let write = self.write.take().context("barrier already signalled")?;

        match retry(|| unsafe {
            libc::write(write.as_raw_fd(), b"\0".as_ptr() as *const libc::c_void, 1)
        }) {
            Ok(_) => Ok(()),
            // waiter already gone; the rendezvous is moot
            Err(Errno::EPIPE) => Ok(()),
            Err(e) => Err(e).context("barrier write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn waiters_release_on_lift() {
        let barrier = Arc::new(Barrier::new());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let b = Arc::clone(&barrier);
                thread::spawn(move || b.wait())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        barrier.lift();
        barrier.lift(); // idempotent

        for w in waiters {
            w.join().unwrap();
        }

        // waiting after the lift returns immediately
        barrier.wait();
    }

    #[test]
    fn pipe_barrier_rendezvous() {
        let barrier = PipeBarrier::open().unwrap();
        let (r, w) = barrier.raw_fds();
        // a second handle over dup'ed fds stands in for the forked copy
        let mut peer = unsafe {
            PipeBarrier::from_raw_fds(
                libc::dup(r),
                libc::dup(w),
            )
        };
        let mut barrier = barrier;

        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            peer.signal().unwrap();
        });

        barrier.wait().unwrap();
        signaller.join().unwrap();
    }

    #[test]
    fn pipe_barrier_reports_dead_peer() {
        let barrier = PipeBarrier::open().unwrap();
        let (r, w) = barrier.raw_fds();
        let peer = unsafe { PipeBarrier::from_raw_fds(libc::dup(r), libc::dup(w)) };
        let mut barrier = barrier;

        let vanishing = thread::spawn(move || drop(peer));
        vanishing.join().unwrap();

        assert!(barrier.wait().is_err());
    }
}
