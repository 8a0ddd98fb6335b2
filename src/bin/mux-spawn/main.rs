use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::setsid;
use tracing::{debug, Level};

use burrow::mux::Muxer;
use burrow::status::StatusWriter;
use burrow::{proc, unix};

mod child;

const RING_CAPACITY: usize = 65535;
const LISTEN_BACKLOG: i32 = 10;
const SOCKET_MODE: u32 = 0o666;
const SOCKET_NAMES: [&str; 3] = ["stdout.sock", "stderr.sock", "status.sock"];

/// Run a command and fan its stdout, stderr and exit status out to
/// attachable Unix-domain sockets.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Directory where stdout.sock, stderr.sock and status.sock are created
    dir: PathBuf,

    /// Command and arguments to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
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
    if let Err(e) = run(&cli) {
        eprintln!("mux-spawn: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    // detach from the launching shell's session; hups and ctrl-c belong
    // to the manager, not to us
    let _ = setsid();
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignore SIGPIPE")?;

    let paths: Vec<PathBuf> = SOCKET_NAMES.iter().map(|n| cli.dir.join(n)).collect();
    let _unlink_sockets = scopeguard::guard(paths.clone(), |paths| {
        for path in paths {
            let _ = std::fs::remove_file(&path);
        }
    });

    let mut listeners = Vec::new();
    for path in &paths {
        listeners.push(
            unix::listen_on(path, LISTEN_BACKLOG, Some(SOCKET_MODE))
                .with_context(|| format!("creating socket at {}", path.display()))?,
        );
    }
    let status_listener = listeners.pop().expect("three listeners");
    let stderr_listener = listeners.pop().expect("three listeners");
    let stdout_listener = listeners.pop().expect("three listeners");

    let spawned = child::spawn(&cli.command)?;
    println!("child_pid={}", spawned.pid);
    std::io::stdout().flush()?;

    let mux_out = Arc::new(Muxer::new(stdout_listener, spawned.stdout, RING_CAPACITY)?);
    let mux_err = Arc::new(Muxer::new(stderr_listener, spawned.stderr, RING_CAPACITY)?);
    let status_writer = Arc::new(StatusWriter::new(status_listener)?);

    let mux_out_thread = thread::spawn({
        let mux = Arc::clone(&mux_out);
        move || mux.run()
    });
    let mux_err_thread = thread::spawn({
        let mux = Arc::clone(&mux_err);
        move || mux.run()
    });
    let status_thread = thread::spawn({
        let sw = Arc::clone(&status_writer);
        move || sw.run()
    });

    // nothing runs until every stream has an observer
    mux_out.wait_for_client();
    mux_err.wait_for_client();
    status_writer.wait_for_client();

    spawned.release.release();
    println!("child active");
    std::io::stdout().flush()?;

    let status = proc::wait_raw(spawned.pid).context("waiting for child")?;
    debug!(status, "child exited");

    status_writer.finish(status);
    status_thread
        .join()
        .map_err(|_| anyhow!("status writer thread panicked"))?;

    mux_out.stop();
    mux_err.stop();
    mux_out_thread
        .join()
        .map_err(|_| anyhow!("stdout muxer thread panicked"))?;
    mux_err_thread
        .join()
        .map_err(|_| anyhow!("stderr muxer thread panicked"))?;

    Ok(())
}
