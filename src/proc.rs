use std::ffi::{c_char, CString};
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::{err, retry};

/// Ties the calling process's lifetime to its parent.
pub fn prctl_death_sig() -> nix::Result<()> {
    err(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) })?;
    Ok(())
}

pub struct ReapedChild {
    pub pid: Pid,
    pub raw_status: i32,
}

/// Drains every reapable child without blocking, yielding raw wait
/// statuses (the wire carries them untranslated).
pub fn reap_children() -> Vec<ReapedChild> {
    let mut reaped = Vec::new();

    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid == -1 {
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => break,
                e => panic!("waitpid: {e}"),
            }
        }
        if pid == 0 {
            break;
        }

        reaped.push(ReapedChild {
            pid: Pid::from_raw(pid),
            raw_status: status,
        });
    }

    reaped
}

/// Blocks until `pid` exits; returns the raw wait status.
pub fn wait_raw(pid: Pid) -> nix::Result<i32> {
    let mut status: libc::c_int = 0;
    retry(|| unsafe { libc::waitpid(pid.as_raw(), &mut status, 0) })?;
    Ok(status)
}

/// Rewrites the kernel-visible process name: PR_SET_NAME for the comm
/// field, plus a freshly mapped argv region so /proc/<pid>/cmdline shows
/// the new title as well.
pub fn set_cmdline_name(name: &str) -> Result<()> {
    let cstr = CString::new(name)?;
    nix::sys::prctl::set_name(&cstr).context("PR_SET_NAME")?;

    let argv_start = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            name.len() + 1,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if argv_start == libc::MAP_FAILED {
        return Err(Errno::last()).context("mmap argv region");
    }
    let argv_start = argv_start as *mut c_char;

    unsafe {
        std::ptr::copy_nonoverlapping(cstr.as_ptr(), argv_start, name.len() + 1);
        let argv_end = argv_start.add(name.len() + 1);

        // the kernel bounds-checks start against end, so the order that
        // works depends on where the old region lies; try both
        if err(libc::prctl(
            libc::PR_SET_MM,
            libc::PR_SET_MM_ARG_START,
            argv_start,
            0,
            0,
        ))
        .is_err()
        {
            err(libc::prctl(
                libc::PR_SET_MM,
                libc::PR_SET_MM_ARG_END,
                argv_end,
                0,
                0,
            ))
            .context("PR_SET_MM_ARG_END")?;
            err(libc::prctl(
                libc::PR_SET_MM,
                libc::PR_SET_MM_ARG_START,
                argv_start,
                0,
                0,
            ))
            .context("PR_SET_MM_ARG_START")?;
        } else {
            err(libc::prctl(
                libc::PR_SET_MM,
                libc::PR_SET_MM_ARG_END,
                argv_end,
                0,
                0,
            ))
            .context("PR_SET_MM_ARG_END")?;
        }
    }

    Ok(())
}

/// Runs one bootstrap hook to completion; a nonzero exit aborts bootstrap.
pub fn run_hook(dir: &Path, name: &str) -> Result<()> {
    let path = dir.join(name);
    let status = Command::new(&path)
        .status()
        .with_context(|| format!("running hook {}", path.display()))?;

    if !status.success() {
        bail!("hook {} exited with {}", path.display(), status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn reap_without_children_is_empty() {
        // may race other tests' children, but must not block or panic
        let _ = reap_children();
    }

    #[test]
    fn hook_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let hook = dir.path().join("failing-hook.sh");
        std::fs::write(&hook, "#!/bin/sh\nexit 3\n").unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = run_hook(dir.path(), "failing-hook.sh").unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[test]
    fn missing_hook_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_hook(dir.path(), "no-such-hook.sh").is_err());
    }
}
