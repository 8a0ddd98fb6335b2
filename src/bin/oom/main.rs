use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use nix::unistd::{access, AccessFlags};
use tracing::{debug, Level};

use burrow::{err, proc};

/// Block until the memory cgroup at the given path reports an
/// out-of-memory event. Exits 0 on a real OOM, 1 otherwise.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the memory cgroup to watch
    cgroup: PathBuf,
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
    match run(&cli) {
        Ok(true) => std::process::exit(0),
        Ok(false) => {
            debug!("cgroup went away without an OOM");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("oom: {e:#}");
            std::process::exit(1);
        }
    }
}

/// Arms a cgroup-v1 OOM notification and waits for it to fire. Returns
/// whether the wakeup was a real OOM (the cgroup still exists) rather
/// than the cgroup being removed.
fn run(cli: &Cli) -> Result<bool> {
    // nothing should keep watching once the manager is gone
    proc::prctl_death_sig().context("PR_SET_PDEATHSIG")?;

    let event_fd = err(unsafe { libc::eventfd(0, 0) }).context("eventfd")?;
    let event_fd = unsafe { OwnedFd::from_raw_fd(event_fd) };

    let oom_control = File::open(cli.cgroup.join("memory.oom_control"))
        .context("open memory.oom_control")?;

    let event_control_path = cli.cgroup.join("cgroup.event_control");
    let mut event_control = OpenOptions::new()
        .write(true)
        .open(&event_control_path)
        .context("open cgroup.event_control")?;

    // register the eventfd for OOM notifications on this cgroup
    writeln!(
        event_control,
        "{} {}",
        event_fd.as_raw_fd(),
        oom_control.as_raw_fd()
    )
    .context("arming event_control")?;

    let mut counter = [0u8; 8];
    let mut event_file = File::from(event_fd);
    event_file
        .read_exact(&mut counter)
        .context("waiting on eventfd")?;
    ensure!(u64::from_ne_bytes(counter) > 0, "empty eventfd wakeup");

    // the eventfd also fires when the cgroup is torn down; only a control
    // file we could still arm means a real OOM
    Ok(access(&event_control_path, AccessFlags::W_OK).is_ok())
}
