use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::errno::Errno;
use tracing::{trace, warn};

use crate::barrier::Barrier;
use crate::ioutil::{atomic_read, atomic_write, wait_readable_or_stop, StopPipe};
use crate::{set_nonblocking, unix};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Done(i32),
}

struct Shared {
    state: State,
    sinks: Vec<OwnedFd>,
}

/// Collects status-socket attachers and broadcasts the child's raw wait
/// status exactly once. No sink receives a single byte before `finish`;
/// afterwards every live sink receives four big-endian bytes and a close.
pub struct StatusWriter {
    shared: Mutex<Shared>,
    client_barrier: Barrier,
    accept_fd: OwnedFd,
    stop: StopPipe,
}

impl StatusWriter {
    pub fn new(accept_fd: OwnedFd) -> nix::Result<Self> {
        set_nonblocking(accept_fd.as_raw_fd())?;
        Ok(Self {
            shared: Mutex::new(Shared {
                state: State::Created,
                sinks: Vec::new(),
            }),
            client_barrier: Barrier::new(),
            accept_fd,
            stop: StopPipe::new()?,
        })
    }

    /// Blocks until at least one client has attached.
    pub fn wait_for_client(&self) {
        self.client_barrier.wait();
    }

    /// Accept loop; returns after `finish` once the status has been
    /// delivered to every sink that is still connected.
    pub fn run(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            assert_eq!(shared.state, State::Created);
            shared.state = State::Started;
        }

        loop {
            let ev = wait_readable_or_stop(self.accept_fd.as_raw_fd(), self.stop.read_fd());

            if ev.readable {
                match unix::accept_cloexec(self.accept_fd.as_raw_fd()) {
                    Ok(sink) => {
                        trace!(fd = sink.as_raw_fd(), "status sink attached");
                        self.shared.lock().unwrap().sinks.push(sink);
                        self.client_barrier.lift();
                    }
                    Err(Errno::EAGAIN) => {}
                    Err(e) => warn!("status accept: {e}"),
                }
            }

            if ev.stop {
                break;
            }
        }

        let (status, sinks) = {
            let mut shared = self.shared.lock().unwrap();
            let status = match shared.state {
                State::Done(status) => status,
                state => panic!("status writer stopped in {state:?}"),
            };
            (status, std::mem::take(&mut shared.sinks))
        };

        let payload = status.to_be_bytes();
        for sink in sinks {
            // best effort; a sink that hung up simply misses the status
            let _ = atomic_write(sink.as_raw_fd(), &payload);
        }
    }

    /// Publishes the final status and wakes the accept loop to deliver it.
    /// May be called at most once, and only while running.
    pub fn finish(&self, status: i32) {
        {
            let mut shared = self.shared.lock().unwrap();
            assert_eq!(shared.state, State::Started);
            shared.state = State::Done(status);
        }
        self.stop.poke();
    }
}

/// Attach-side accumulator for the four status bytes.
pub struct StatusReader {
    fd: RawFd,
    buf: [u8; 4],
    fill: usize,
    status: Option<i32>,
}

impl StatusReader {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: [0; 4],
            fill: 0,
            status: None,
        }
    }

    /// Returns true once finished: either the full status arrived or the
    /// writer hung up first (in which case `status` stays `None`).
    pub fn run(&mut self) -> bool {
        let fill = self.fill;
        let (n, hup) = atomic_read(self.fd, &mut self.buf[fill..]);
        self.fill += n;

        if self.fill == self.buf.len() {
            self.status = Some(i32::from_be_bytes(self.buf));
            return true;
        }
        hup
    }

    pub fn status(&self) -> Option<i32> {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::unix::{connect_to, listen_on};

    struct SinkResult {
        status: Option<i32>,
    }

    #[test]
    fn status_is_one_shot_and_post_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.sock");
        let listener = listen_on(&path, 10, None).unwrap();

        let sw = Arc::new(StatusWriter::new(listener).unwrap());
        let runner = {
            let sw = Arc::clone(&sw);
            thread::spawn(move || sw.run())
        };

        let mut sinks = Vec::new();
        for _ in 0..3 {
            let connected = Arc::new(Barrier::new());
            let done = {
                let path = path.clone();
                let connected = Arc::clone(&connected);
                thread::spawn(move || {
                    let fd = connect_to(&path).unwrap();
                    connected.lift();

                    // nothing may arrive before finish
                    thread::sleep(Duration::from_millis(30));
                    let mut pfd = [libc::pollfd {
                        fd: fd.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    }];
                    let rv = unsafe { libc::poll(pfd.as_mut_ptr(), 1, 0) };
                    assert_eq!(rv, 0, "status bytes before finish");

                    let mut reader = StatusReader::new(fd.as_raw_fd());
                    while !reader.run() {}

                    // the writer closes after exactly four bytes
                    let mut extra = [0u8; 1];
                    let (n, hup) = atomic_read(fd.as_raw_fd(), &mut extra);
                    assert_eq!((n, hup), (0, true));

                    SinkResult {
                        status: reader.status(),
                    }
                })
            };
            connected.wait();
            sinks.push(done);
        }

        sw.wait_for_client();
        // give the accept loop time to drain the backlog before finishing
        thread::sleep(Duration::from_millis(50));
        sw.finish(10);
        runner.join().unwrap();

        for sink in sinks {
            let result = sink.join().unwrap();
            assert_eq!(result.status, Some(10));
        }
    }

    #[test]
    fn reader_reports_hup_without_status() {
        let (a, b) = crate::ioutil::pipe_cloexec().unwrap();
        let mut reader = StatusReader::new(a.as_raw_fd());

        atomic_write(b.as_raw_fd(), &[0, 0]);
        drop(b);

        assert!(reader.run());
        assert_eq!(reader.status(), None);
    }
}
