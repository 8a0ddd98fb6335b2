use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use tracing::{debug, trace, Level};

use burrow::ioutil::revents_readable;
use burrow::pump::Pump;
use burrow::status::StatusReader;
use burrow::{retry, set_nonblocking, unix};

const SOCKET_NAMES: [&str; 3] = ["stdout.sock", "stderr.sock", "status.sock"];
const INTERNAL_ERROR_STATUS: i32 = 255;

/// Attach to a running mux-spawn, replaying buffered output and following
/// the live stream until the command exits.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// File where the stream resume offsets are persisted
    #[arg(short = 'w', value_name = "PATH")]
    resume_path: Option<PathBuf>,

    /// Directory containing stdout.sock, stderr.sock and status.sock
    dir: PathBuf,
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
            eprintln!("mux-link: {e:#}");
            INTERNAL_ERROR_STATUS
        }
    };
    std::process::exit(code);
}

fn read_saved_positions(path: &Path) -> Result<[u32; 2]> {
    match std::fs::read(path) {
        Ok(bytes) => {
            if bytes.len() < 8 {
                bail!("short resume file {}", path.display());
            }
            Ok([
                u32::from_be_bytes(bytes[0..4].try_into().expect("4-byte slice")),
                u32::from_be_bytes(bytes[4..8].try_into().expect("4-byte slice")),
            ])
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok([0, 0]),
        Err(e) => Err(e).with_context(|| format!("reading resume file {}", path.display())),
    }
}

fn write_positions(path: &Path, positions: [u32; 2]) {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&positions[0].to_be_bytes());
    buf[4..8].copy_from_slice(&positions[1].to_be_bytes());
    // checkpointing is best effort on the way out
    if let Err(e) = std::fs::write(path, buf) {
        debug!("writing resume file: {e}");
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let saved = match &cli.resume_path {
        Some(path) => read_saved_positions(path)?,
        None => [0, 0],
    };

    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;

    let mut socks: Vec<Option<OwnedFd>> = Vec::new();
    for name in SOCKET_NAMES {
        let fd = unix::connect_to(&cli.dir.join(name))?;
        set_nonblocking(fd.as_raw_fd())?;
        socks.push(Some(fd));
    }

    // checkpoint signals join the poll loop through a signalfd so they
    // never land in the middle of a forwarded chunk
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.thread_block().context("blocking signals")?;
    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
        .context("signalfd")?;

    let mut pumps = [
        Pump::new(
            socks[0].as_ref().expect("connected").as_raw_fd(),
            libc::STDOUT_FILENO,
            saved[0],
        ),
        Pump::new(
            socks[1].as_ref().expect("connected").as_raw_fd(),
            libc::STDERR_FILENO,
            saved[1],
        ),
    ];
    let mut status_reader =
        StatusReader::new(socks[2].as_ref().expect("connected").as_raw_fd());
    let mut exit_status = INTERNAL_ERROR_STATUS;

    loop {
        if socks.iter().all(Option::is_none) {
            break;
        }

        let mut pfds = [
            pollfd_for(&socks[0]),
            pollfd_for(&socks[1]),
            pollfd_for(&socks[2]),
            libc::pollfd {
                fd: sfd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        retry(|| unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, -1) })
            .context("poll")?;

        if revents_readable(pfds[3].revents) {
            trace!("checkpoint signal received");
            save_positions(cli, &pumps);
            return Ok(0);
        }

        for i in 0..2 {
            if socks[i].is_some() && revents_readable(pfds[i].revents) && pumps[i].run() {
                trace!(stream = i, "pump finished");
                socks[i] = None;
            }
        }

        if socks[2].is_some() && revents_readable(pfds[2].revents) && status_reader.run() {
            if let Some(raw) = status_reader.status() {
                if libc::WIFEXITED(raw) {
                    exit_status = libc::WEXITSTATUS(raw);
                }
                debug!(raw, exit_status, "status received");
            }
            socks[2] = None;
        }
    }

    save_positions(cli, &pumps);
    Ok(exit_status)
}

fn pollfd_for(sock: &Option<OwnedFd>) -> libc::pollfd {
    libc::pollfd {
        // poll skips negative fds, so closed streams drop out naturally
        fd: sock.as_ref().map_or(-1, |fd| fd.as_raw_fd()),
        events: libc::POLLIN,
        revents: 0,
    }
}

fn save_positions(cli: &Cli, pumps: &[Pump; 2]) {
    if let Some(path) = &cli.resume_path {
        write_positions(path, [pumps[0].pos(), pumps[1].pos()]);
    }
}
