use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use nix::unistd::{execvp, fork, ForkResult, Pid};

use burrow::ioutil::{atomic_read, atomic_write, pipe_cloexec};
use burrow::{err, proc};

/// Write end of the pipe the child blocks on before exec. Dropping it
/// without releasing makes the child exit 1.
pub struct ReleasePipe(OwnedFd);

impl ReleasePipe {
    pub fn release(self) {
        let _ = atomic_write(self.0.as_raw_fd(), b"X");
    }
}

pub struct SpawnedChild {
    pub pid: Pid,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
    pub release: ReleasePipe,
}

/// Forks the command with stdout/stderr redirected into fresh pipes. The
/// child parks on the release pipe so no output can exist before every
/// stream has an observer, and dies with us via PDEATHSIG.
pub fn spawn(argv: &[String]) -> Result<SpawnedChild> {
    assert!(!argv.is_empty());

    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .context("argument with NUL byte")?;

    let (stdout_r, stdout_w) = pipe_cloexec()?;
    let (stderr_r, stderr_w) = pipe_cloexec()?;
    let (release_r, release_w) = pipe_cloexec()?;

    match unsafe { fork() }.context("fork child")? {
        ForkResult::Child => {
            // pre-exec, still on the parent's address space snapshot
            let _ = err(unsafe { libc::dup2(stdout_w.as_raw_fd(), libc::STDOUT_FILENO) });
            let _ = err(unsafe { libc::dup2(stderr_w.as_raw_fd(), libc::STDERR_FILENO) });
            let _ = proc::prctl_death_sig();

            let mut byte = [0u8; 1];
            let (n, _) = atomic_read(release_r.as_raw_fd(), &mut byte);
            if n == 0 {
                // the spawner went away without releasing us
                std::process::exit(1);
            }

            let _ = execvp(&args[0], &args);
            eprintln!("mux-spawn: exec {:?}: {}", argv[0], nix::errno::Errno::last());
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            drop(stdout_w);
            drop(stderr_w);
            drop(release_r);

            Ok(SpawnedChild {
                pid: child,
                stdout: stdout_r,
                stderr: stderr_r,
                release: ReleasePipe(release_w),
            })
        }
    }
}
