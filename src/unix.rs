use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::{err, retry};

fn sockaddr_un(path: &Path) -> Result<libc::sockaddr_un> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // one byte must remain for the terminating NUL
    if bytes.len() >= addr.sun_path.len() {
        bail!("socket path too long: {}", path.display());
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    Ok(addr)
}

fn stream_socket() -> nix::Result<OwnedFd> {
    let fd = err(unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Binds a stream listener at `path`, replacing any stale socket file.
/// `mode`, when given, opens the socket up to unprivileged peers in the
/// same container.
pub fn listen_on(path: &Path, backlog: i32, mode: Option<u32>) -> Result<OwnedFd> {
    let fd = stream_socket()?;
    let addr = sockaddr_un(path)?;

    let _ = std::fs::remove_file(path);
    err(unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    })
    .with_context(|| format!("bind {}", path.display()))?;

    err(unsafe { libc::listen(fd.as_raw_fd(), backlog) })
        .with_context(|| format!("listen on {}", path.display()))?;

    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {}", path.display()))?;
    }

    Ok(fd)
}

pub fn connect_to(path: &Path) -> Result<OwnedFd> {
    let fd = stream_socket()?;
    let addr = sockaddr_un(path)?;

    retry(|| unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    })
    .with_context(|| format!("connect to {}", path.display()))?;

    Ok(fd)
}

pub fn accept_cloexec(listen_fd: RawFd) -> nix::Result<OwnedFd> {
    let fd = retry(|| unsafe {
        libc::accept4(
            listen_fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;
    use crate::ioutil::{atomic_read, atomic_write};

    #[test]
    fn listener_roundtrip_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");

        let listener = listen_on(&path, 10, Some(0o666)).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().mode() & 0o777,
            0o666
        );

        let client = connect_to(&path).unwrap();
        let server = accept_cloexec(listener.as_raw_fd()).unwrap();

        atomic_write(client.as_raw_fd(), b"ping");
        let mut buf = [0u8; 4];
        let (n, hup) = atomic_read(server.as_raw_fd(), &mut buf);
        assert_eq!((n, hup), (4, false));
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn rebind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");

        let first = listen_on(&path, 10, None).unwrap();
        drop(first);
        listen_on(&path, 10, None).unwrap();
    }

    #[test]
    fn overlong_path_rejected() {
        let long = "x".repeat(200);
        let path = Path::new("/tmp").join(long);
        assert!(listen_on(&path, 10, None).is_err());
    }
}
