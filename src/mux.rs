use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Mutex;
use std::thread;

use nix::errno::Errno;
use tracing::{trace, warn};

use crate::barrier::Barrier;
use crate::ioutil::{atomic_read, atomic_write, wait_readable_or_stop, StopPipe};
use crate::ring::RingBuffer;
use crate::{set_nonblocking, unix};

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Stopped,
}

struct Shared {
    ring: RingBuffer,
    source_pos: u32,
    sinks: Vec<OwnedFd>,
    state: State,
}

/// Fans one source fd out to any number of attached sinks. A sink
/// attaching late first receives a 4-byte big-endian header carrying the
/// logical offset of the oldest buffered byte, then the ring contents,
/// then a strict tail of everything the source produces afterwards.
///
/// One lock guards ring, position, sink list and state; both a full pump
/// (read + append + broadcast) and a full sink catch-up run under it, which
/// is what makes every sink's byte stream contiguous.
pub struct Muxer {
    shared: Mutex<Shared>,
    client_barrier: Barrier,
    source_fd: OwnedFd,
    accept_fd: OwnedFd,
    acceptor_stop: StopPipe,
    rw_stop: StopPipe,
}

impl Muxer {
    pub fn new(accept_fd: OwnedFd, source_fd: OwnedFd, ring_capacity: usize) -> nix::Result<Self> {
        set_nonblocking(accept_fd.as_raw_fd())?;
        set_nonblocking(source_fd.as_raw_fd())?;

        Ok(Self {
            shared: Mutex::new(Shared {
                ring: RingBuffer::new(ring_capacity),
                source_pos: 0,
                sinks: Vec::new(),
                state: State::Created,
            }),
            client_barrier: Barrier::new(),
            source_fd,
            accept_fd,
            acceptor_stop: StopPipe::new()?,
            rw_stop: StopPipe::new()?,
        })
    }

    /// Blocks until at least one sink has attached and caught up.
    pub fn wait_for_client(&self) {
        self.client_barrier.wait();
    }

    /// Reader loop plus acceptor thread; returns once the source hangs up
    /// or `stop` is called. All sinks are closed on the way out.
    pub fn run(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            assert_eq!(shared.state, State::Created);
            shared.state = State::Started;
        }

        trace!(
            accept_fd = self.accept_fd.as_raw_fd(),
            source_fd = self.source_fd.as_raw_fd(),
            "muxer running"
        );

        thread::scope(|scope| {
            scope.spawn(|| self.acceptor());

            loop {
                let ev = wait_readable_or_stop(self.source_fd.as_raw_fd(), self.rw_stop.read_fd());

                if ev.readable && self.pump() {
                    break;
                }
                if ev.stop {
                    break;
                }
            }

            self.acceptor_stop.poke();
            // scope joins the acceptor before returning
        });

        self.shared.lock().unwrap().sinks.clear();
        trace!(source_fd = self.source_fd.as_raw_fd(), "muxer done");
    }

    /// Requests shutdown of a running muxer; `run` unwinds cooperatively.
    pub fn stop(&self) {
        {
            let mut shared = self.shared.lock().unwrap();
            assert_eq!(shared.state, State::Started);
            shared.state = State::Stopped;
        }
        self.rw_stop.poke();
    }

    /// Moves one chunk from the source into the ring and every sink.
    /// Returns true when the source hung up.
    fn pump(&self) -> bool {
        let mut buf = [0u8; READ_BUF_SIZE];
        let (nread, hup) = atomic_read(self.source_fd.as_raw_fd(), &mut buf);

        let mut shared = self.shared.lock().unwrap();
        shared.ring.append(&buf[..nread]);
        shared.source_pos += nread as u32;
        Self::broadcast(&mut shared, &buf[..nread]);

        hup
    }

    fn broadcast(shared: &mut Shared, data: &[u8]) {
        shared.sinks.retain(|sink| {
            let (_, hup) = atomic_write(sink.as_raw_fd(), data);
            if hup {
                trace!(fd = sink.as_raw_fd(), "sink hangup, dropping");
            }
            !hup
        });
    }

    fn acceptor(&self) {
        trace!(
            fd = self.accept_fd.as_raw_fd(),
            "accepting sink connections"
        );

        loop {
            let ev = wait_readable_or_stop(self.accept_fd.as_raw_fd(), self.acceptor_stop.read_fd());

            if ev.readable {
                match unix::accept_cloexec(self.accept_fd.as_raw_fd()) {
                    Ok(sink) => self.attach(sink),
                    Err(Errno::EAGAIN) => {}
                    Err(e) => {
                        warn!("sink accept: {e}");
                        break;
                    }
                }
            }

            if ev.stop {
                break;
            }
        }
    }

    fn attach(&self, sink: OwnedFd) {
        let mut shared = self.shared.lock().unwrap();

        trace!(fd = sink.as_raw_fd(), "catching up new sink");
        if Self::catch_up(&shared, &sink) {
            // sink closed before it saw any data
            return;
        }

        shared.sinks.push(sink);
        drop(shared);

        self.client_barrier.lift();
    }

    /// Sends the offset header plus current ring contents; true on hangup.
    /// The shared lock must be held so no tail bytes slip in between.
    fn catch_up(shared: &Shared, sink: &OwnedFd) -> bool {
        let header = (shared.source_pos - shared.ring.len() as u32).to_be_bytes();
        let (_, hup) = atomic_write(sink.as_raw_fd(), &header);
        if hup {
            return true;
        }

        let buffered = shared.ring.dup();
        let (_, hup) = atomic_write(sink.as_raw_fd(), &buffered);
        hup
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::RawFd;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::ioutil::pipe_cloexec;
    use crate::pump::Pump;
    use crate::unix::{connect_to, listen_on};

    const RING: usize = 256;

    fn ignore_sigpipe() {
        use nix::sys::signal::{signal, SigHandler, Signal};
        unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.unwrap();
    }

    struct Sink {
        data: Vec<u8>,
        target: usize,
        caught_up: Arc<Barrier>,
    }

    fn spawn_sink(
        path: std::path::PathBuf,
        target: usize,
    ) -> (Arc<Barrier>, thread::JoinHandle<Vec<u8>>) {
        let caught_up = Arc::new(Barrier::new());
        let barrier = Arc::clone(&caught_up);
        let handle = thread::spawn(move || {
            let fd = connect_to(&path).unwrap();
            let mut sink = Sink {
                data: Vec::new(),
                target,
                caught_up: barrier,
            };
            loop {
                let mut byte = [0u8; 1];
                let (n, hup) = atomic_read(fd.as_raw_fd(), &mut byte);
                sink.data.extend_from_slice(&byte[..n]);
                if sink.data.len() >= sink.target {
                    sink.caught_up.lift();
                }
                if hup {
                    break;
                }
            }
            sink.data
        });
        (caught_up, handle)
    }

    fn write_all(fd: RawFd, byte: u8, count: usize) {
        for _ in 0..count {
            let (n, hup) = atomic_write(fd, &[byte]);
            assert_eq!((n, hup), (1, false));
        }
    }

    #[test]
    fn sinks_see_consistent_views_across_ring_wrap() {
        ignore_sigpipe();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = listen_on(&path, 10, None).unwrap();
        let (source_r, source_w) = pipe_cloexec().unwrap();

        let muxer = Arc::new(Muxer::new(listener, source_r, RING).unwrap());
        let runner = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.run())
        };

        // fill the ring exactly
        write_all(source_w.as_raw_fd(), b'A', RING);

        // early sinks; the second one acknowledges the full stream so the
        // late sink cannot attach before the wrap has been appended
        let (b0, s0) = spawn_sink(path.clone(), 4 + RING);
        let (b1, s1) = spawn_sink(path.clone(), 4 + 2 * RING);
        b0.wait();

        // wrap the ring completely
        write_all(source_w.as_raw_fd(), b'B', RING);
        b1.wait();

        // late sink only ever sees the second ring's worth
        let (b2, s2) = spawn_sink(path.clone(), 4 + RING);
        b2.wait();

        muxer.stop();
        runner.join().unwrap();

        let d0 = s0.join().unwrap();
        let d1 = s1.join().unwrap();
        let d2 = s2.join().unwrap();

        // early sinks saw everything from offset zero
        assert_eq!(d0.len(), 4 + 2 * RING);
        assert_eq!(&d0[..4], &0u32.to_be_bytes());
        assert_eq!(d0, d1);

        // the late sink's header says it missed the first ring's worth
        assert_eq!(d2.len(), 4 + RING);
        assert_eq!(&d2[..4], &(RING as u32).to_be_bytes());
        assert!(d2[4..].iter().all(|&b| b == b'B'));
    }

    #[test]
    fn source_hangup_ends_run_and_closes_sinks() {
        ignore_sigpipe();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = listen_on(&path, 10, None).unwrap();
        let (source_r, source_w) = pipe_cloexec().unwrap();

        let muxer = Arc::new(Muxer::new(listener, source_r, RING).unwrap());
        let runner = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.run())
        };

        let (caught_up, sink) = spawn_sink(path.clone(), 4 + 3);
        atomic_write(source_w.as_raw_fd(), b"abc");
        caught_up.wait();

        drop(source_w);
        runner.join().unwrap();

        let data = sink.join().unwrap();
        assert_eq!(&data[..4], &0u32.to_be_bytes());
        assert_eq!(&data[4..], b"abc");
    }

    #[test]
    fn dropped_sink_does_not_stall_the_stream() {
        ignore_sigpipe();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = listen_on(&path, 10, None).unwrap();
        let (source_r, source_w) = pipe_cloexec().unwrap();

        let muxer = Arc::new(Muxer::new(listener, source_r, RING).unwrap());
        let runner = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.run())
        };

        // a sink that vanishes right after attaching
        let quitter = connect_to(&path).unwrap();
        muxer.wait_for_client();
        drop(quitter);

        let (caught_up, survivor) = spawn_sink(path.clone(), 4 + 2);
        atomic_write(source_w.as_raw_fd(), b"ok");
        caught_up.wait();
        thread::sleep(Duration::from_millis(20));

        muxer.stop();
        runner.join().unwrap();

        let data = survivor.join().unwrap();
        assert_eq!(&data[4..], b"ok");
    }

    fn pump_when_ready(fd: RawFd, pump: &mut Pump) {
        let mut pfd = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let rv = unsafe { libc::poll(pfd.as_mut_ptr(), 1, 2000) };
        assert!(rv > 0, "muxer never delivered the replay");
        pump.run();
    }

    #[test]
    fn resumed_attacher_skips_replayed_bytes() {
        ignore_sigpipe();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.sock");
        let listener = listen_on(&path, 10, None).unwrap();
        let (source_r, source_w) = pipe_cloexec().unwrap();

        let muxer = Arc::new(Muxer::new(listener, source_r, RING).unwrap());
        let runner = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || muxer.run())
        };

        atomic_write(source_w.as_raw_fd(), b"0123456789");

        // first attacher consumes everything from offset zero
        let first = connect_to(&path).unwrap();
        crate::set_nonblocking(first.as_raw_fd()).unwrap();
        let (out_r, out_w) = pipe_cloexec().unwrap();
        crate::set_nonblocking(out_r.as_raw_fd()).unwrap();

        let mut pump = Pump::new(first.as_raw_fd(), out_w.as_raw_fd(), 0);
        let mut got = Vec::new();
        while got.len() < 10 {
            pump_when_ready(first.as_raw_fd(), &mut pump);
            let mut buf = [0u8; 64];
            let (n, _) = atomic_read(out_r.as_raw_fd(), &mut buf);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"0123456789");
        let saved = pump.pos();
        assert_eq!(saved, 10);
        drop(first);

        // a resumed attacher is replayed the ring but emits nothing new
        let second = connect_to(&path).unwrap();
        crate::set_nonblocking(second.as_raw_fd()).unwrap();
        let (out2_r, out2_w) = pipe_cloexec().unwrap();
        crate::set_nonblocking(out2_r.as_raw_fd()).unwrap();

        let mut resumed = Pump::new(second.as_raw_fd(), out2_w.as_raw_fd(), saved);
        while resumed.pos() < saved {
            pump_when_ready(second.as_raw_fd(), &mut resumed);
        }

        let mut buf = [0u8; 64];
        let (n, _) = atomic_read(out2_r.as_raw_fd(), &mut buf);
        assert_eq!(n, 0, "replayed bytes were emitted again");

        muxer.stop();
        runner.join().unwrap();
    }
}
