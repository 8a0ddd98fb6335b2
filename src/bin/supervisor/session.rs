use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{chdir, execvpe, fork, setsid, setgid, setuid, ForkResult, Gid, Uid};
use tracing::{debug, trace};

use burrow::ioutil::pipe_cloexec;
use burrow::session::{SessionRequest, SessionResponse};
use burrow::{err, fdpass, passwd, pty};

use crate::continuation::ChildMap;

/// One accepted client connection becomes one forked child with its stdio
/// delivered back through SCM_RIGHTS.
pub fn handle(stream: OwnedFd, children: &mut ChildMap) -> Result<()> {
    let mut stream = File::from(stream);
    let request = SessionRequest::read_from(&mut stream).context("reading session request")?;
    request.validate()?;

    trace!(tty = request.tty, user = request.user(), "session request");
    if request.tty != 0 {
        handle_tty(stream, &request, children)
    } else {
        handle_pipe(stream, &request, children)
    }
}

/// TTY session: the client gets the pty master and the status read end;
/// the child gets the slave on all three stdio fds.
fn handle_tty(stream: File, request: &SessionRequest, children: &mut ChildMap) -> Result<()> {
    let pty = pty::open_pty()?;
    let (status_r, status_w) = pipe_cloexec().context("status pipe")?;

    let response = SessionResponse::new();
    fdpass::send_with_fds(
        stream.as_raw_fd(),
        response.as_bytes(),
        &[pty.master.as_raw_fd(), status_r.as_raw_fd()],
    )
    .context("sending session fds")?;

    let slave = pty.slave.as_raw_fd();
    match unsafe { fork() }.context("fork session child")? {
        ForkResult::Child => {
            std::process::exit(exec_session_child(request, slave, slave, slave, true));
        }
        ForkResult::Parent { child } => {
            debug!(pid = child.as_raw(), "tty session started");
            children.insert(child.as_raw(), status_w);
            // pty pair, status read end and client stream close here; the
            // client now owns the only master and status reader
            Ok(())
        }
    }
}

/// Pipe session: four pipes, with the client holding stdin's write end
/// and the read ends of the rest.
fn handle_pipe(stream: File, request: &SessionRequest, children: &mut ChildMap) -> Result<()> {
    let (stdin_r, stdin_w) = pipe_cloexec().context("stdin pipe")?;
    let (stdout_r, stdout_w) = pipe_cloexec().context("stdout pipe")?;
    let (stderr_r, stderr_w) = pipe_cloexec().context("stderr pipe")?;
    let (status_r, status_w) = pipe_cloexec().context("status pipe")?;

    let response = SessionResponse::new();
    fdpass::send_with_fds(
        stream.as_raw_fd(),
        response.as_bytes(),
        &[
            stdin_w.as_raw_fd(),
            stdout_r.as_raw_fd(),
            stderr_r.as_raw_fd(),
            status_r.as_raw_fd(),
        ],
    )
    .context("sending session fds")?;

    match unsafe { fork() }.context("fork session child")? {
        ForkResult::Child => {
            std::process::exit(exec_session_child(
                request,
                stdin_r.as_raw_fd(),
                stdout_w.as_raw_fd(),
                stderr_w.as_raw_fd(),
                false,
            ));
        }
        ForkResult::Parent { child } => {
            debug!(pid = child.as_raw(), "pipe session started");
            children.insert(child.as_raw(), status_w);
            Ok(())
        }
    }
}

/// Post-fork setup in the session child; never returns on success. Any
/// failure before exec maps to exit code 255.
fn exec_session_child(
    request: &SessionRequest,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    tty: bool,
) -> i32 {
    match session_child(request, stdin_fd, stdout_fd, stderr_fd, tty) {
        Ok(never) => match never {},
        Err(e) => {
            eprintln!("supervisor: session child: {e:#}");
            255
        }
    }
}

fn session_child(
    request: &SessionRequest,
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    tty: bool,
) -> Result<Infallible> {
    err(unsafe { libc::dup2(stdin_fd, libc::STDIN_FILENO) }).context("dup2 stdin")?;
    err(unsafe { libc::dup2(stdout_fd, libc::STDOUT_FILENO) }).context("dup2 stdout")?;
    err(unsafe { libc::dup2(stderr_fd, libc::STDERR_FILENO) }).context("dup2 stderr")?;

    setsid().context("setsid")?;
    if tty {
        // the freshly dup'ed slave becomes the controlling terminal
        err(unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) })
            .context("TIOCSCTTY")?;
    }

    let user = match request.user() {
        "" => "root",
        user => user,
    };
    let pw = passwd::getpwnam(user)?.ok_or_else(|| anyhow!("no such user: {user}"))?;

    let mut argv = request.args()?;
    if argv.is_empty() {
        argv.push(CString::new("/bin/sh").expect("static path"));
    }

    request.rlim.apply().context("applying rlimits")?;

    setgid(Gid::from_raw(pw.gid)).context("setgid")?;
    setuid(Uid::from_raw(pw.uid)).context("setuid")?;
    chdir(Path::new(&pw.home)).with_context(|| format!("chdir to {}", pw.home))?;

    let path = if pw.uid == 0 {
        "PATH=/sbin:/bin:/usr/sbin:/usr/bin"
    } else {
        "PATH=/bin:/usr/bin"
    };
    let mut envp = vec![
        CString::new(format!("HOME={}", pw.home))?,
        CString::new(format!("USER={}", pw.name))?,
        CString::new(path).expect("static env"),
    ];
    if let Some(lang) = request.lang() {
        envp.push(CString::new(format!("LANG={lang}"))?);
    }

    // undo the supervisor's SIGCHLD mask before handing over
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .context("resetting signal mask")?;

    let never = execvpe(&argv[0], &argv, &envp).with_context(|| format!("exec {:?}", argv[0]))?;
    match never {}
}
