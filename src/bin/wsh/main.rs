use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::thread;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use nix::sys::signal::{signal as set_signal, SigHandler, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
use signal_hook::consts::SIGWINCH;
use signal_hook::iterator::Signals;
use tracing::{debug, trace, Level};

use burrow::ioutil::revents_readable;
use burrow::session::{RlimitTable, SessionRequest, SessionResponse};
use burrow::{err, fdpass, retry, set_nonblocking, unix};

const INTERNAL_ERROR_STATUS: i32 = 255;
const COPY_CHUNK: usize = 64 * 1024;

/// Run a command inside the container through its supervisor, with stdio
/// attached to the local terminal or pipes.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the supervisor socket
    #[arg(long, default_value = "run/supervisor.sock")]
    socket: PathBuf,

    /// User to run the command as
    #[arg(long)]
    user: Option<String>,

    /// rsh compatibility: accept and discard rsh-style flags plus the
    /// host token at the start of the command line
    #[arg(long)]
    rsh: bool,

    /// Command and arguments (empty runs a shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(if cfg!(debug_assertions) {
            Level::TRACE
        } else {
            Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("wsh: {e:#}");
            INTERNAL_ERROR_STATUS
        }
    };
    std::process::exit(code);
}

/// rsh sends `[-46dn] [-l user] [-t timeout] host command...`; everything
/// but `-l` is noise to us, and the host token is implicit in the socket.
fn strip_rsh_prefix(args: &[String], user: &mut Option<String>) -> Result<Vec<String>> {
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.peek() {
        match arg.as_str() {
            "-4" | "-6" | "-d" | "-n" => {
                iter.next();
            }
            "-l" => {
                iter.next();
                let name = iter.next().context("-l requires a user name")?;
                *user = Some(name.clone());
            }
            "-t" => {
                iter.next();
                iter.next().context("-t requires a timeout")?;
            }
            other if other.starts_with('-') => bail!("unsupported rsh option {other}"),
            _ => break,
        }
    }

    iter.next().context("rsh mode requires a host argument")?;
    Ok(iter.cloned().collect())
}

fn run(cli: &Cli) -> Result<i32> {
    let mut user = cli.user.clone();
    let argv = if cli.rsh {
        strip_rsh_prefix(&cli.args, &mut user)?
    } else {
        cli.args.clone()
    };

    unsafe { set_signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;

    let tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;

    let mut request = SessionRequest::new();
    request.tty = tty as i32;
    request.set_args(&argv)?;
    request.rlim = RlimitTable::from_env()?;
    request.set_user(user.as_deref())?;
    if let Ok(lang) = std::env::var("LANG") {
        request.set_lang(&lang)?;
    }

    let sock = unix::connect_to(&cli.socket)?;
    let mut stream = File::from(sock);
    stream
        .write_all(request.as_bytes())
        .context("sending session request")?;

    if tty {
        interactive(stream)
    } else {
        noninteractive(stream)
    }
}

fn recv_session_fds(stream: &File, want: usize) -> Result<Vec<OwnedFd>> {
    let mut buf = [0u8; std::mem::size_of::<SessionResponse>()];
    let mut fds = Vec::new();
    let n = fdpass::recv_with_fds(stream.as_raw_fd(), &mut buf, &mut fds)
        .context("receiving session response")?;
    ensure!(n == buf.len(), "session response truncated");
    SessionResponse::from_bytes(&buf)?;
    ensure!(fds.len() == want, "expected {want} session fds, got {}", fds.len());
    Ok(fds)
}

fn interactive(stream: File) -> Result<i32> {
    let mut fds = recv_session_fds(&stream, 2)?;
    let status_fd = fds.pop().expect("two fds");
    let master = fds.pop().expect("two fds");

    // raw local terminal for the duration; restored on every exit path
    let saved_termios = tcgetattr(&std::io::stdin()).context("tcgetattr")?;
    let mut raw = saved_termios.clone();
    cfmakeraw(&mut raw);
    tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &raw).context("tcsetattr raw")?;
    let _restore = scopeguard::guard(saved_termios, |saved| {
        let _ = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &saved);
    });

    // mirror the local window size now and on every change
    copy_winsize(libc::STDIN_FILENO, master.as_raw_fd())?;
    let master_raw = master.as_raw_fd();
    let mut winch = Signals::new([SIGWINCH]).context("SIGWINCH handler")?;
    thread::spawn(move || {
        for _ in winch.forever() {
            let _ = copy_winsize(libc::STDIN_FILENO, master_raw);
        }
    });

    // independent duplicates decouple the two pump directions
    let master_out = dup_fd(master.as_raw_fd())?;
    let mut pairs = [
        PumpPair::new(libc::STDIN_FILENO, master.as_raw_fd(), Some(master)),
        PumpPair::new(master_out.as_raw_fd(), libc::STDOUT_FILENO, Some(master_out)),
    ];

    pump_session(&mut pairs, status_fd)
}

fn noninteractive(stream: File) -> Result<i32> {
    let mut fds = recv_session_fds(&stream, 4)?;
    let status_fd = fds.pop().expect("four fds");
    let stderr_r = fds.pop().expect("four fds");
    let stdout_r = fds.pop().expect("four fds");
    let stdin_w = fds.pop().expect("four fds");

    let mut pairs = [
        PumpPair::new(libc::STDIN_FILENO, stdin_w.as_raw_fd(), Some(stdin_w)),
        PumpPair::new(stdout_r.as_raw_fd(), libc::STDOUT_FILENO, Some(stdout_r)),
        PumpPair::new(stderr_r.as_raw_fd(), libc::STDERR_FILENO, Some(stderr_r)),
    ];

    pump_session(&mut pairs, status_fd)
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    use std::os::fd::FromRawFd;
    let new = err(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3) }).context("dup")?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

fn copy_winsize(local: RawFd, remote: RawFd) -> Result<()> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    err(unsafe { libc::ioctl(local, libc::TIOCGWINSZ as _, &mut ws) }).context("TIOCGWINSZ")?;
    err(unsafe { libc::ioctl(remote, libc::TIOCSWINSZ as _, &ws) }).context("TIOCSWINSZ")?;
    Ok(())
}

/// One stdio forwarding direction. The remote end is owned so closing the
/// pair propagates EOF to the session child.
struct PumpPair {
    rfd: RawFd,
    wfd: RawFd,
    remote: Option<OwnedFd>,
    open: bool,
}

impl PumpPair {
    fn new(rfd: RawFd, wfd: RawFd, remote: Option<OwnedFd>) -> Self {
        Self {
            rfd,
            wfd,
            remote,
            open: true,
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.remote.take();
    }

    /// Forwards one chunk; closes the pair on EOF or a hangup on either
    /// side. A pty master reports EIO once the slave side is gone, which
    /// is its flavour of EOF.
    fn copy_chunk(&mut self) {
        let mut buf = [0u8; COPY_CHUNK];
        let n = match retry(|| unsafe {
            libc::read(self.rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        }) {
            Ok(0) => {
                trace!(rfd = self.rfd, "eof");
                self.close();
                return;
            }
            Ok(n) => n as usize,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(nix::errno::Errno::EIO) => {
                self.close();
                return;
            }
            Err(e) => {
                debug!(rfd = self.rfd, "read: {e}");
                self.close();
                return;
            }
        };

        if !write_fully(self.wfd, &buf[..n]) {
            self.close();
        }
    }
}

/// Blocking-equivalent write on a possibly nonblocking fd: waits for
/// writability on EAGAIN so no bytes are ever dropped. False on hangup.
fn write_fully(fd: RawFd, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        match retry(|| unsafe {
            libc::write(fd, data.as_ptr() as *const libc::c_void, data.len())
        }) {
            Ok(n) => data = &data[n as usize..],
            Err(nix::errno::Errno::EAGAIN) => {
                let mut pfd = [libc::pollfd {
                    fd,
                    events: libc::POLLOUT,
                    revents: 0,
                }];
                let _ = retry(|| unsafe { libc::poll(pfd.as_mut_ptr(), 1, -1) });
            }
            Err(nix::errno::Errno::EPIPE) | Err(nix::errno::Errno::EIO) => return false,
            Err(e) => {
                debug!(fd, "write: {e}");
                return false;
            }
        }
    }
    true
}

fn pump_session(pairs: &mut [PumpPair], status_fd: OwnedFd) -> Result<i32> {
    for pair in pairs.iter() {
        set_nonblocking(pair.rfd)?;
    }
    set_nonblocking(status_fd.as_raw_fd())?;

    let mut status_buf = [0u8; 4];
    let mut status_fill = 0;

    loop {
        let mut pfds: Vec<libc::pollfd> = pairs
            .iter()
            .map(|pair| libc::pollfd {
                fd: if pair.open { pair.rfd } else { -1 },
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        pfds.push(libc::pollfd {
            fd: status_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });

        retry(|| unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) })
            .context("poll")?;

        for (pair, pfd) in pairs.iter_mut().zip(&pfds) {
            if pair.open && revents_readable(pfd.revents) {
                pair.copy_chunk();
            }
        }

        let status_revents = pfds.last().expect("status pollfd").revents;
        if revents_readable(status_revents) {
            let n = match retry(|| unsafe {
                libc::read(
                    status_fd.as_raw_fd(),
                    status_buf[status_fill..].as_mut_ptr() as *mut libc::c_void,
                    status_buf.len() - status_fill,
                )
            }) {
                Ok(n) => n as usize,
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => return Err(e).context("reading exit status"),
            };

            if n == 0 {
                // supervisor died before delivering a status
                drain_pairs(pairs);
                return Ok(INTERNAL_ERROR_STATUS);
            }

            status_fill += n;
            if status_fill == status_buf.len() {
                let raw = i32::from_ne_bytes(status_buf);
                // one more pass so buffered output lands before we exit
                drain_pairs(pairs);
                debug!(raw, "session finished");
                return Ok(map_wait_status(raw));
            }
        }
    }
}

fn drain_pairs(pairs: &mut [PumpPair]) {
    for pair in pairs.iter_mut() {
        if pair.open {
            pair.copy_chunk();
        }
    }
}

fn map_wait_status(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        // the shell convention for signal deaths
        128 + libc::WTERMSIG(raw)
    } else {
        INTERNAL_ERROR_STATUS
    }
}
