use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sched::{clone, unshare, CloneFlags};
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::unistd::{chdir, execv, mkdir, pivot_root, Pid};
use tracing::{debug, info};

use burrow::barrier::PipeBarrier;
use burrow::{proc, unix, unset_cloexec};

use crate::handoff::{self, HandoffState, HANDOFF_VERSION};
use crate::Cli;

const LISTEN_BACKLOG: i32 = 10;

// plenty for the hook runner and pivot before the re-exec
const CHILD_STACK_SIZE: usize = 1024 * 1024;

fn assert_directory(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => bail!("{}: not a directory", path.display()),
        Err(e) => bail!("{}: {}", path.display(), e),
    }
}

/// Outer half of the bootstrap: runs on the host side of the namespaces,
/// clones the supervisor-to-be and exits once it is accepting sessions.
pub fn run(cli: &Cli) -> Result<()> {
    assert_directory(&cli.run)?;
    assert_directory(&cli.lib)?;
    assert_directory(&cli.root)?;

    // private mount namespace so the before-clone hook can mount freely
    // without touching the host's
    unshare(CloneFlags::CLONE_NEWNS).context("unshare mount namespace")?;

    let socket_path = cli.run.join("supervisor.sock");
    let listen_fd = unix::listen_on(&socket_path, LISTEN_BACKLOG, None)?;

    let mut barrier_parent = PipeBarrier::open().context("parent barrier")?;
    let mut barrier_child = PipeBarrier::open().context("child barrier")?;

    proc::run_hook(&cli.lib, "hook-parent-before-clone.sh")?;

    // the child needs to know, ahead of the pivot, where its own binary
    // will reappear under the old root
    let self_exe = std::fs::read_link("/proc/self/exe").context("resolve own binary")?;

    let pid = spawn_supervisor(cli, &listen_fd, &mut barrier_parent, &mut barrier_child, &self_exe)?;
    info!(%pid, "cloned supervisor");

    // parent-side hooks address the new namespaces through $PID
    std::env::set_var("PID", pid.to_string());
    proc::run_hook(&cli.lib, "hook-parent-after-clone.sh")?;

    barrier_parent
        .signal()
        .context("waking up supervisor child")?;
    barrier_child
        .wait()
        .context("waiting for acknowledgement from supervisor child")?;

    debug!("supervisor is serving, parent exiting");
    Ok(())
}

fn spawn_supervisor(
    cli: &Cli,
    listen_fd: &OwnedFd,
    barrier_parent: &mut PipeBarrier,
    barrier_child: &mut PipeBarrier,
    self_exe: &Path,
) -> Result<Pid> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS;

    let pid = unsafe {
        clone(
            Box::new(|| -> isize {
                // child_run only returns on failure; success is an exec
                match child_run(cli, listen_fd, barrier_parent, barrier_child, self_exe) {
                    Ok(never) => match never {},
                    Err(e) => {
                        eprintln!("supervisor: child: {e:#}");
                        1
                    }
                }
            }),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .context("clone")?;

    Ok(pid)
}

/// Inner half: PID 1 of the new namespaces. Waits for the parent-side
/// hooks, pivots into the prepared root and re-execs itself through the
/// old-root path so the continuation starts clean inside the container.
fn child_run(
    cli: &Cli,
    listen_fd: &OwnedFd,
    barrier_parent: &mut PipeBarrier,
    barrier_child: &mut PipeBarrier,
    self_exe: &Path,
) -> Result<std::convert::Infallible> {
    barrier_parent.wait().context("waiting for parent")?;

    proc::run_hook(&cli.lib, "hook-child-before-pivot.sh")?;

    // both paths are about to move under /mnt
    let lib_abs = std::fs::canonicalize(&cli.lib).context("resolve lib path")?;
    let pivoted_lib = prefix_mnt(&lib_abs)?;
    let pivoted_exe = prefix_mnt(self_exe)?;

    chdir(&cli.root).context("chdir to new root")?;
    match mkdir("mnt", Mode::S_IRWXU) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e).context("mkdir mnt"),
    }
    pivot_root(".", "mnt").context("pivot_root")?;
    chdir("/").context("chdir to pivoted root")?;

    proc::run_hook(&pivoted_lib, "hook-child-after-pivot.sh")?;

    let mut state = HandoffState {
        version: HANDOFF_VERSION,
        listen_fd: listen_fd.as_raw_fd(),
        barrier_read_fd: barrier_child.raw_fds().0,
        barrier_write_fd: barrier_child.raw_fds().1,
        has_title: 0,
        title: [0; handoff::TITLE_SIZE],
    };
    if let Some(title) = &cli.title {
        state.set_title(title);
    }
    handoff::save(&state).context("saving handoff state")?;

    // these must survive the exec
    unset_cloexec(listen_fd.as_raw_fd()).context("listen fd cloexec")?;
    barrier_child
        .set_cloexec(false)
        .context("barrier cloexec")?;

    let exe = CString::new(pivoted_exe.as_os_str().as_bytes())?;
    let never = execv(
        &exe,
        &[CString::new("supervisor")?, CString::new("--continue")?],
    )
    .context("re-exec for continuation")?;
    match never {}
}

fn prefix_mnt(path: &Path) -> Result<PathBuf> {
    let rel = path
        .strip_prefix("/")
        .with_context(|| format!("{} is not absolute", path.display()))?;
    Ok(Path::new("/mnt").join(rel))
}
