use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use anyhow::{Context, Result};

use crate::err;

pub struct Pty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/* libc's openpty calls grantpt, which drags in the dynamic resolver; the
 * libc inside the container may not match the one this binary was built
 * against, so the pair is allocated straight from the ptmx device. */
pub fn open_pty() -> Result<Pty> {
    let master = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open("/dev/ptmx")
        .context("open /dev/ptmx")?;

    let mut pty_no: libc::c_int = 0;
    err(unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGPTN as _, &mut pty_no) })
        .context("TIOCGPTN")?;

    // unlock the slave before opening it
    let unlock: libc::c_int = 0;
    err(unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSPTLCK as _, &unlock) })
        .context("TIOCSPTLCK")?;

    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
        .open(format!("/dev/pts/{pty_no}"))
        .with_context(|| format!("open /dev/pts/{pty_no}"))?;

    Ok(Pty {
        master: OwnedFd::from(master),
        slave: OwnedFd::from(slave),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioutil::{atomic_read, atomic_write};

    #[test]
    fn master_and_slave_are_wired() {
        if !std::path::Path::new("/dev/ptmx").exists() {
            return;
        }

        let pty = open_pty().unwrap();

        // newline so the canonical-mode slave completes a line
        atomic_write(pty.master.as_raw_fd(), b"x\n");
        let mut buf = [0u8; 2];
        let (n, hup) = atomic_read(pty.slave.as_raw_fd(), &mut buf);
        assert!(n >= 1);
        assert!(!hup);
        assert_eq!(buf[0], b'x');
    }
}
