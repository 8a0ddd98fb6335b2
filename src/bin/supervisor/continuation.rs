use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::setsid;
use tracing::{debug, info, trace, warn};

use burrow::barrier::PipeBarrier;
use burrow::ioutil::atomic_write;
use burrow::{proc, retry, set_cloexec, unix};

use crate::handoff::{self, HANDOFF_VERSION};
use crate::session;

/// Exit-status write ends of live session children, keyed by pid. The
/// client holds the only read end, so a session outliving its client
/// still gets its status written (into a full pipe at worst).
pub type ChildMap = HashMap<libc::pid_t, OwnedFd>;

/// Inner half after the re-exec: now running from the pivoted root as
/// PID 1 of the namespaces. Recovers the handoff, finishes detaching from
/// the old root and serves sessions forever.
pub fn run() -> Result<()> {
    let state = handoff::load().context("loading handoff state")?;
    anyhow::ensure!(
        state.version == HANDOFF_VERSION,
        "handoff version {} does not match {}",
        state.version,
        HANDOFF_VERSION
    );

    let listen_fd = unsafe { OwnedFd::from_raw_fd(state.listen_fd) };
    let mut barrier_child =
        unsafe { PipeBarrier::from_raw_fds(state.barrier_read_fd, state.barrier_write_fd) };

    // the crossing is over; nothing may leak into session children
    set_cloexec(listen_fd.as_raw_fd())?;
    barrier_child.set_cloexec(true)?;

    if let Some(title) = state.title() {
        if let Err(e) = proc::set_cmdline_name(title) {
            debug!("setting process title: {e:#}");
        }
    }

    // the binary we re-exec'ed lives under the old root; a lazy detach
    // keeps its mapping alive while removing the tree from the namespace
    umount2("/mnt", MntFlags::MNT_DETACH).context("detaching pivoted root")?;
    let _ = setsid();

    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;

    barrier_child
        .signal()
        .context("acknowledging to the bootstrap parent")?;

    serve(listen_fd)
}

fn serve(listen_fd: OwnedFd) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("blocking SIGCHLD")?;
    let mut sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
        .context("signalfd")?;

    let mut children: ChildMap = ChildMap::new();

    info!("supervisor serving");
    loop {
        let mut pfds = [
            libc::pollfd {
                fd: listen_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: sfd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        retry(|| unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) })
            .context("poll")?;

        if pfds[0].revents & libc::POLLIN != 0 {
            match unix::accept_cloexec(listen_fd.as_raw_fd()) {
                Ok(stream) => {
                    if let Err(e) = session::handle(stream, &mut children) {
                        warn!("session setup failed: {e:#}");
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => warn!("accept: {e}"),
            }
        }

        if pfds[1].revents & libc::POLLIN != 0 {
            drain_signalfd(&mut sfd);
            reap(&mut children);
        }
    }
}

fn drain_signalfd(sfd: &mut SignalFd) {
    loop {
        match sfd.read_signal() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                warn!("signalfd read: {e}");
                break;
            }
        }
    }
}

/// Forwards the raw wait status of every reaped session child to its
/// client. Pids not in the map are reparented descendants of sessions and
/// are dropped silently.
fn reap(children: &mut ChildMap) {
    for reaped in proc::reap_children() {
        let pid: libc::pid_t = reaped.pid.as_raw();
        match children.remove(&pid) {
            Some(status_fd) => {
                trace!(pid, status = reaped.raw_status, "session child exited");
                let bytes: [u8; 4] = reaped.raw_status.to_ne_bytes();
                let _ = atomic_write(status_fd.as_raw_fd(), &bytes);
                // dropping the fd closes the write end; the client sees EOF
                // after the four status bytes
            }
            None => trace!(pid, "reaped reparented descendant"),
        }
    }
}
